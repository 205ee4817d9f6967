//! Connection pool and statement cache for the coordinator database.
//!
//! Compared to an off-the-shelf pool we additionally:
//! - cap the number of cached prepared statements per connection so the
//!   Postgres server's memory use stays bounded,
//! - reap idle connections, since indexer instances release their connection
//!   whenever they sleep and may not come back for a while,
//! - substitute the per-run schema into statements, so prepared-statement
//!   reuse stays correct across runs.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Weak,
    },
    time::Duration,
};

use anyhow::Context as _;
use common::{
    errors::OperationTimeout,
    knobs::{
        COORDINATOR_INACTIVE_CONNECTION_LIFETIME,
        COORDINATOR_MAX_CACHED_STATEMENTS,
        COORDINATOR_MAX_CONNECTIONS,
        COORDINATOR_TIMEOUT,
    },
    types::RunId,
};
use lru::LruCache;
use parking_lot::Mutex;
use postgres_protocol::escape::escape_identifier;
use tokio::{
    sync::{
        OwnedSemaphorePermit,
        Semaphore,
    },
    task::JoinHandle,
    time::Instant,
};
use tokio_postgres::{
    types::ToSql,
    Row,
    Statement,
    Transaction,
};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::metrics::{
    get_connection_timer,
    log_connection_created,
    log_poisoned_connection,
};

/// Bounds any single database call.
pub(crate) async fn with_timeout<R, E, Fut>(operation: &'static str, f: Fut) -> anyhow::Result<R>
where
    E: Into<anyhow::Error>,
    Fut: Future<Output = Result<R, E>>,
{
    match tokio::time::timeout(*COORDINATOR_TIMEOUT, f).await {
        Ok(Ok(r)) => Ok(r),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(OperationTimeout {
            operation,
            timeout_ms: COORDINATOR_TIMEOUT.as_millis() as u64,
        }
        .into()),
    }
}

/// The escaped form of a run's coordinator schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaName {
    escaped: String,
}

impl SchemaName {
    pub fn for_run(run_id: &RunId) -> anyhow::Result<Self> {
        Self::new(&run_id.schema_name())
    }

    pub fn new(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(!s.starts_with("pg_"), "schema {s:?} is reserved");
        anyhow::ensure!(!s.contains('\0'), "schema name contains NUL");
        Ok(Self {
            escaped: escape_identifier(s),
        })
    }

    pub fn escaped(&self) -> &str {
        &self.escaped
    }
}

type StatementCache = Mutex<LruCache<String, Statement>>;

/// A connection owned by either the pool (idle) or a checked-out
/// [`CoordinatorConnection`].
struct PooledConnection {
    client: tokio_postgres::Client,
    statement_cache: StatementCache,
    last_used: Instant,
}

impl PooledConnection {
    fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            statement_cache: Mutex::new(LruCache::new(*COORDINATOR_MAX_CACHED_STATEMENTS)),
            last_used: Instant::now(),
        }
    }
}

async fn prepare_cached(
    client: &tokio_postgres::Client,
    cache: &StatementCache,
    statement: String,
) -> anyhow::Result<Statement> {
    if let Some(prepared) = cache.lock().get(&statement) {
        return Ok(prepared.clone());
    }
    let prepared = client.prepare(&statement).await?;
    // At capacity this evicts the coldest statement, which deallocates it on
    // the server.
    cache.lock().put(statement, prepared.clone());
    Ok(prepared)
}

fn handle_error(poisoned: &AtomicBool, e: impl Into<anyhow::Error>) -> anyhow::Error {
    let e: anyhow::Error = e.into();
    let connection_broken = e
        .downcast_ref::<tokio_postgres::Error>()
        .is_some_and(|e| e.is_closed())
        || e.downcast_ref::<OperationTimeout>().is_some();
    if connection_broken {
        tracing::error!("not reusing coordinator connection after error: {e:#}");
        poisoned.store(true, Ordering::Relaxed);
    }
    e
}

/// An active connection checked out of a [`PgPool`], pinned to one run
/// schema. Returned to the pool on drop unless poisoned.
pub struct CoordinatorConnection {
    pool: Arc<PgPool>,
    _permit: OwnedSemaphorePermit,
    conn: Option<PooledConnection>,
    poisoned: AtomicBool,
    schema: SchemaName,
}

impl CoordinatorConnection {
    fn substitute_schema(&self, query: &'static str) -> String {
        query.replace("@db_name", &self.schema.escaped)
    }

    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }

    fn conn(&self) -> &PooledConnection {
        self.conn.as_ref().expect("connection only taken in Drop")
    }

    pub async fn batch_execute(&self, query: &'static str) -> anyhow::Result<()> {
        let query = self.substitute_schema(query);
        with_timeout("batch_execute", self.conn().client.batch_execute(&query))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn prepare_cached(&self, query: &'static str) -> anyhow::Result<Statement> {
        let conn = self.conn();
        with_timeout(
            "prepare",
            prepare_cached(
                &conn.client,
                &conn.statement_cache,
                self.substitute_schema(query),
            ),
        )
        .await
        .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        with_timeout("query", self.conn().client.query(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn query_opt(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Option<Row>> {
        with_timeout("query_opt", self.conn().client.query_opt(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        with_timeout("execute", self.conn().client.execute(statement, params))
            .await
            .map_err(|e| handle_error(&self.poisoned, e))
    }

    pub async fn transaction(&mut self) -> anyhow::Result<CoordinatorTransaction<'_>> {
        let schema = self.schema.clone();
        let conn = self.conn.as_mut().expect("connection only taken in Drop");
        let inner = match with_timeout("begin", conn.client.transaction()).await {
            Ok(tx) => tx,
            Err(e) => return Err(handle_error(&self.poisoned, e)),
        };
        Ok(CoordinatorTransaction {
            inner,
            statement_cache: &conn.statement_cache,
            poisoned: &self.poisoned,
            schema,
        })
    }
}

impl Drop for CoordinatorConnection {
    fn drop(&mut self) {
        if self.poisoned.load(Ordering::Relaxed) {
            log_poisoned_connection();
            return;
        }
        let mut conn = self.conn.take().expect("connection only taken in Drop");
        conn.last_used = Instant::now();
        let mut idle = self.pool.connections.lock();
        if !self.pool.semaphore.is_closed() {
            idle.push_back(conn);
        }
    }
}

/// An open transaction on a [`CoordinatorConnection`]. Rolls back on drop
/// unless committed.
pub struct CoordinatorTransaction<'a> {
    inner: Transaction<'a>,
    statement_cache: &'a StatementCache,
    poisoned: &'a AtomicBool,
    schema: SchemaName,
}

impl CoordinatorTransaction<'_> {
    pub async fn prepare_cached(&self, query: &'static str) -> anyhow::Result<Statement> {
        with_timeout(
            "prepare",
            prepare_cached(
                self.inner.client(),
                self.statement_cache,
                query.replace("@db_name", &self.schema.escaped),
            ),
        )
        .await
        .map_err(|e| handle_error(self.poisoned, e))
    }

    pub async fn query(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        with_timeout("tx_query", self.inner.query(statement, params))
            .await
            .map_err(|e| handle_error(self.poisoned, e))
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        with_timeout("tx_execute", self.inner.execute(statement, params))
            .await
            .map_err(|e| handle_error(self.poisoned, e))
    }

    pub async fn commit(self) -> anyhow::Result<()> {
        with_timeout("commit", self.inner.commit())
            .await
            .map_err(|e| handle_error(self.poisoned, e))
    }
}

/// Connection pool for one coordinator database. Always used behind `Arc`.
pub struct PgPool {
    pg_config: tokio_postgres::Config,
    tls_connect: MakeRustlsConnect,
    semaphore: Arc<Semaphore>,
    /// Idle connections ordered by `last_used`, oldest first.
    connections: Mutex<VecDeque<PooledConnection>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PgPool {
    pub fn new(pg_config: tokio_postgres::Config, tls_connect: MakeRustlsConnect) -> Arc<Self> {
        let max_size = *COORDINATOR_MAX_CONNECTIONS;
        tracing::info!("coordinator pool max size {max_size}");
        let pool = Arc::new(PgPool {
            pg_config,
            tls_connect,
            semaphore: Arc::new(Semaphore::new(max_size)),
            connections: Mutex::new(VecDeque::new()),
            reaper: Mutex::new(None),
        });
        let reaper = tokio::spawn(Self::reap_idle_connections(Arc::downgrade(&pool)));
        *pool.reaper.lock() = Some(reaper);
        pool
    }

    pub async fn get_connection(
        self: &Arc<Self>,
        name: &'static str,
        schema: &SchemaName,
    ) -> anyhow::Result<CoordinatorConnection> {
        let timer = get_connection_timer();
        let permit = with_timeout(name, async {
            self.semaphore
                .clone()
                .acquire_owned()
                .await
                .context("coordinator pool has been shut down")
        })
        .await?;
        let conn = {
            let reusable = {
                let mut idle = self.connections.lock();
                // Reuse the most recently returned connection; stale ones age
                // out from the front.
                loop {
                    match idle.pop_back() {
                        Some(conn) if conn.client.is_closed() => continue,
                        other => break other,
                    }
                }
            };
            match reusable {
                Some(conn) => conn,
                None => self.create_connection().await?,
            }
        };
        drop(timer);
        Ok(CoordinatorConnection {
            pool: self.clone(),
            _permit: permit,
            conn: Some(conn),
            poisoned: AtomicBool::new(false),
            schema: schema.clone(),
        })
    }

    async fn create_connection(&self) -> anyhow::Result<PooledConnection> {
        let (client, connection) = with_timeout(
            "connect",
            self.pg_config.connect(self.tls_connect.clone()),
        )
        .await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("coordinator connection error: {e}");
            }
        });
        log_connection_created();
        Ok(PooledConnection::new(client))
    }

    /// Closes idle connections and prevents new checkouts.
    pub fn shutdown(&self) {
        self.semaphore.close();
        self.connections.lock().clear();
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
    }

    async fn reap_idle_connections(pool: Weak<Self>) {
        loop {
            let oldest = match pool.upgrade() {
                Some(pool) => pool.close_expired_connections(),
                None => break,
            };
            let next_wakeup = oldest.unwrap_or_else(Instant::now)
                + *COORDINATOR_INACTIVE_CONNECTION_LIFETIME;
            tokio::time::sleep_until(next_wakeup + Duration::from_millis(50)).await;
        }
    }

    // Returns the last_used of the oldest surviving connection.
    fn close_expired_connections(&self) -> Option<Instant> {
        let mut connections = self.connections.lock();
        while let Some(conn) = connections.front() {
            if conn.last_used.elapsed() > *COORDINATOR_INACTIVE_CONNECTION_LIFETIME {
                connections.pop_front();
            } else {
                break;
            }
        }
        connections.front().map(|conn| conn.last_used)
    }
}

impl Drop for PgPool {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
    }
}
