//! Postgres-backed implementation of the coordinator contracts.
//!
//! One schema per run, two coordination tables plus the externally populated
//! `metadata` table. All claims go through a single auto-committed INSERT on
//! a composite primary key; losing the race surfaces as the unique-violation
//! SQLSTATE, never as error-message text. Each coordinator handle caches at
//! most one pooled connection and drops it whenever the owning loop goes
//! idle, keeping the pool small while instance counts grow.

mod connection;
mod metrics;
mod sql;

use std::{
    collections::{
        BTreeMap,
        HashSet,
    },
    sync::{
        Arc,
        LazyLock,
    },
};

use anyhow::Context as _;
use async_trait::async_trait;
use common::{
    coordinator::{
        BatchCoordinator,
        BatchRow,
        BatchStatus,
        ClaimOutcome,
        GapRow,
        GapStatus,
        SplitOutcome,
    },
    errors::{
        MetadataNotFound,
        OperationTimeout,
    },
    metadata::{
        MetadataReader,
        RunMetadata,
        SAMPLING_INTERVAL_KEY,
    },
    runtime::Runtime,
    types::{
        BatchFileName,
        IndexerClass,
        IndexerInstanceId,
        RunId,
        TickRange,
    },
};
use parking_lot::Mutex;
use rustls::{
    ClientConfig,
    RootCertStore,
};
use rustls_pki_types::{
    pem::PemObject,
    CertificateDer,
};
use serde_json::Value as JsonValue;
use tokio_postgres::error::SqlState;
use tokio_postgres_rustls::MakeRustlsConnect;

pub use crate::connection::{
    CoordinatorConnection,
    PgPool,
    SchemaName,
};
use crate::metrics::log_schema_initialized;

/// Builds the shared connection pool for a coordinator database URL. One
/// pool serves every indexer instance in the process.
pub fn create_pool(url: &str) -> anyhow::Result<Arc<PgPool>> {
    let pg_config: tokio_postgres::Config =
        url.parse().context("invalid coordinator database url")?;
    let mut roots = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    anyhow::ensure!(
        native_certs.errors.is_empty(),
        "failed to load native certs: {:?}",
        native_certs.errors
    );
    for cert in native_certs.certs {
        roots.add(cert)?;
    }
    if let Some(ca_file_path) = std::env::var_os("COORDINATOR_CA_FILE") {
        let ca_file_content = std::fs::read(&ca_file_path)
            .with_context(|| format!("failed to read CA file {ca_file_path:?}"))?;
        for ca_cert in CertificateDer::pem_slice_iter(&ca_file_content) {
            roots.add(ca_cert.with_context(|| format!("bad PEM in {ca_file_path:?}"))?)?;
        }
    }
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(PgPool::new(pg_config, MakeRustlsConnect::new(tls_config)))
}

// Schemas whose coordination tables this process has already created. The
// DDL is idempotent; this only avoids re-running it per instance.
static INITIALIZED_SCHEMAS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

struct Inner {
    schema: Option<SchemaName>,
    conn: Option<CoordinatorConnection>,
}

pub struct PostgresCoordinator<RT: Runtime> {
    rt: RT,
    class: IndexerClass,
    pool: Arc<PgPool>,
    inner: tokio::sync::Mutex<Inner>,
}

impl<RT: Runtime> PostgresCoordinator<RT> {
    /// The indexer class is mandatory up front; there is no separate
    /// initialization step to forget.
    pub fn new(rt: RT, pool: Arc<PgPool>, class: IndexerClass) -> Self {
        Self {
            rt,
            class,
            pool,
            inner: tokio::sync::Mutex::new(Inner {
                schema: None,
                conn: None,
            }),
        }
    }

    /// Lazily (re)establishes the cached connection for the selected run.
    async fn connected<'a>(
        pool: &Arc<PgPool>,
        inner: &'a mut Inner,
    ) -> anyhow::Result<&'a mut CoordinatorConnection> {
        let schema = inner
            .schema
            .clone()
            .context("no run selected; call set_run first")?;
        if inner.conn.is_none() {
            inner.conn = Some(pool.get_connection("coordinator", &schema).await?);
        }
        Ok(inner.conn.as_mut().expect("just established"))
    }

    fn drop_if_poisoned(inner: &mut Inner) {
        if inner.conn.as_ref().is_some_and(|c| c.is_poisoned()) {
            inner.conn = None;
        }
    }

    fn is_unique_violation(e: &anyhow::Error) -> bool {
        e.downcast_ref::<tokio_postgres::Error>()
            .and_then(|e| e.code())
            .is_some_and(|code| *code == SqlState::UNIQUE_VIOLATION)
    }

    fn is_missing_relation(e: &anyhow::Error) -> bool {
        e.downcast_ref::<tokio_postgres::Error>()
            .and_then(|e| e.code())
            .is_some_and(|code| {
                *code == SqlState::UNDEFINED_TABLE || *code == SqlState::INVALID_SCHEMA_NAME
            })
    }
}

fn parse_batch_status(status: &str) -> anyhow::Result<BatchStatus> {
    match status {
        "claimed" => Ok(BatchStatus::Claimed),
        "completed" => Ok(BatchStatus::Completed),
        "failed" => Ok(BatchStatus::Failed),
        _ => anyhow::bail!("unknown batch status {status:?}"),
    }
}

fn parse_gap_status(status: &str) -> anyhow::Result<GapStatus> {
    match status {
        "pending" => Ok(GapStatus::Pending),
        "permanent" => Ok(GapStatus::Permanent),
        _ => anyhow::bail!("unknown gap status {status:?}"),
    }
}

fn gap_status_str(status: GapStatus) -> &'static str {
    match status {
        GapStatus::Pending => "pending",
        GapStatus::Permanent => "permanent",
    }
}

#[async_trait]
impl<RT: Runtime> BatchCoordinator for PostgresCoordinator<RT> {
    async fn set_run(&self, run_id: &RunId) -> anyhow::Result<()> {
        let schema = SchemaName::for_run(run_id)?;
        if !INITIALIZED_SCHEMAS.lock().contains(schema.escaped()) {
            let conn = self.pool.get_connection("init_schema", &schema).await?;
            conn.batch_execute(sql::CREATE_SCHEMA_SQL).await?;
            conn.batch_execute(sql::INIT_SQL).await?;
            INITIALIZED_SCHEMAS
                .lock()
                .insert(schema.escaped().to_owned());
            log_schema_initialized();
        }
        let mut inner = self.inner.lock().await;
        inner.conn = None;
        inner.schema = Some(schema);
        Ok(())
    }

    async fn try_claim(
        &self,
        filename: &BatchFileName,
        instance_id: &IndexerInstanceId,
    ) -> anyhow::Result<ClaimOutcome> {
        let now = self.rt.unix_timestamp_ms();
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let stmt = conn.prepare_cached(sql::TRY_CLAIM).await?;
            conn.execute(
                &stmt,
                &[
                    &self.class.as_str(),
                    &filename.as_str(),
                    &filename.tick_start(),
                    &filename.tick_end(),
                    &instance_id.as_str(),
                    &now,
                ],
            )
            .await
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        match result {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(e) if Self::is_unique_violation(&e) => Ok(ClaimOutcome::AlreadyClaimed),
            Err(e) => Err(e),
        }
    }

    async fn mark_completed(&self, filename: &BatchFileName) -> anyhow::Result<()> {
        let now = self.rt.unix_timestamp_ms();
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let stmt = conn.prepare_cached(sql::MARK_COMPLETED).await?;
            conn.execute(&stmt, &[&self.class.as_str(), &filename.as_str(), &now])
                .await?;
            Ok(())
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        result
    }

    async fn mark_failed(
        &self,
        filename: &BatchFileName,
        error_message: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let stmt = conn.prepare_cached(sql::MARK_FAILED).await?;
            conn.execute(
                &stmt,
                &[&self.class.as_str(), &filename.as_str(), &error_message],
            )
            .await?;
            Ok(())
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        result
    }

    async fn max_completed_tick_end(&self) -> anyhow::Result<i64> {
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let stmt = conn.prepare_cached(sql::MAX_COMPLETED_TICK_END).await?;
            let row = conn
                .query_opt(&stmt, &[&self.class.as_str()])
                .await?
                .context("MAX() returned no row")?;
            Ok(row.try_get::<_, Option<i64>>(0)?.unwrap_or(-1))
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        result
    }

    async fn record_gap(&self, gap: TickRange) -> anyhow::Result<()> {
        let now = self.rt.unix_timestamp_ms();
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let stmt = conn.prepare_cached(sql::RECORD_GAP).await?;
            conn.execute(&stmt, &[&self.class.as_str(), &gap.start, &gap.end, &now])
                .await?;
            Ok(())
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        result
    }

    async fn oldest_pending_gap(&self) -> anyhow::Result<Option<GapRow>> {
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let stmt = conn.prepare_cached(sql::OLDEST_PENDING_GAP).await?;
            let row = match conn.query_opt(&stmt, &[&self.class.as_str()]).await? {
                Some(row) => row,
                None => return Ok(None),
            };
            Ok(Some(GapRow {
                range: TickRange::new(row.try_get(0)?, row.try_get(1)?)?,
                first_detected_ms: row.try_get(2)?,
                status: parse_gap_status(row.try_get(3)?)?,
            }))
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        result
    }

    async fn mark_gap_permanent(&self, gap_start: i64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let stmt = conn.prepare_cached(sql::MARK_GAP_PERMANENT).await?;
            conn.execute(&stmt, &[&self.class.as_str(), &gap_start])
                .await?;
            Ok(())
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        result
    }

    async fn split_gap(
        &self,
        gap: TickRange,
        batch: TickRange,
        sampling_interval: i64,
    ) -> anyhow::Result<SplitOutcome> {
        let now = self.rt.unix_timestamp_ms();
        let class = self.class.as_str();
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let tx = conn.transaction().await?;
            let lock_stmt = tx.prepare_cached(sql::LOCK_GAP).await?;
            let rows = match tx.query(&lock_stmt, &[&class, &gap.start]).await {
                Ok(rows) => rows,
                // A lock wait that outlives the statement timeout is
                // indistinguishable from losing the race; the next iteration
                // re-reads gap state.
                Err(e) if e.downcast_ref::<OperationTimeout>().is_some() => {
                    return Ok(SplitOutcome::Conflict)
                },
                Err(e) => return Err(e),
            };
            let row = match rows.first() {
                Some(row) => row,
                None => return Ok(SplitOutcome::Conflict),
            };
            let gap_end: i64 = row.try_get(0)?;
            let status = parse_gap_status(row.try_get(1)?)?;
            if gap_end != gap.end {
                // Concurrently rewritten by another instance's split.
                return Ok(SplitOutcome::Conflict);
            }
            let delete_stmt = tx.prepare_cached(sql::DELETE_GAP).await?;
            tx.execute(&delete_stmt, &[&class, &gap.start]).await?;
            let insert_stmt = tx.prepare_cached(sql::INSERT_GAP).await?;
            let status_str = gap_status_str(status);
            if gap.start <= batch.start - sampling_interval {
                let left_end = batch.start - sampling_interval;
                tx.execute(
                    &insert_stmt,
                    &[&class, &gap.start, &left_end, &now, &status_str],
                )
                .await?;
            }
            if batch.end + sampling_interval <= gap.end {
                let right_start = batch.end + sampling_interval;
                tx.execute(
                    &insert_stmt,
                    &[&class, &right_start, &gap.end, &now, &status_str],
                )
                .await?;
            }
            tx.commit().await?;
            Ok(SplitOutcome::Split)
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        result
    }

    async fn list_batches(&self) -> anyhow::Result<Vec<BatchRow>> {
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let stmt = conn.prepare_cached(sql::LIST_BATCHES).await?;
            let rows = conn.query(&stmt, &[&self.class.as_str()]).await?;
            rows.iter()
                .map(|row| {
                    Ok(BatchRow {
                        filename: row.try_get::<_, &str>(0)?.parse()?,
                        instance_id: IndexerInstanceId::from(row.try_get::<_, String>(1)?),
                        claim_ts_ms: row.try_get(2)?,
                        completion_ts_ms: row.try_get(3)?,
                        status: parse_batch_status(row.try_get(4)?)?,
                        error_message: row.try_get(5)?,
                    })
                })
                .collect()
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        result
    }

    async fn list_gaps(&self) -> anyhow::Result<Vec<GapRow>> {
        let mut inner = self.inner.lock().await;
        let result = async {
            let conn = Self::connected(&self.pool, &mut inner).await?;
            let stmt = conn.prepare_cached(sql::LIST_GAPS).await?;
            let rows = conn.query(&stmt, &[&self.class.as_str()]).await?;
            rows.iter()
                .map(|row| {
                    Ok(GapRow {
                        range: TickRange::new(row.try_get(0)?, row.try_get(1)?)?,
                        first_detected_ms: row.try_get(2)?,
                        status: parse_gap_status(row.try_get(3)?)?,
                    })
                })
                .collect()
        }
        .await;
        Self::drop_if_poisoned(&mut inner);
        result
    }

    fn release_connection(&self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.conn = None;
        }
    }
}

#[async_trait]
impl<RT: Runtime> MetadataReader for PostgresCoordinator<RT> {
    async fn has_metadata(&self, run_id: &RunId) -> anyhow::Result<bool> {
        // Metadata polling happens before this instance selects the run and
        // must not pin a pooled connection between polls, so this borrows a
        // connection just for the query.
        let schema = SchemaName::for_run(run_id)?;
        let conn = self.pool.get_connection("has_metadata", &schema).await?;
        let result = async {
            let stmt = conn.prepare_cached(sql::HAS_METADATA).await?;
            Ok(conn
                .query_opt(&stmt, &[&SAMPLING_INTERVAL_KEY])
                .await?
                .is_some())
        }
        .await;
        match result {
            // The metadata indexer has not created the schema yet.
            Err(e) if Self::is_missing_relation(&e) => Ok(false),
            other => other,
        }
    }

    async fn get_metadata(&self, run_id: &RunId) -> anyhow::Result<RunMetadata> {
        let schema = SchemaName::for_run(run_id)?;
        let conn = self.pool.get_connection("get_metadata", &schema).await?;
        let result = async {
            let stmt = conn.prepare_cached(sql::GET_METADATA).await?;
            let rows = conn.query(&stmt, &[]).await?;
            let mut values = BTreeMap::new();
            for row in &rows {
                let key: String = row.try_get(0)?;
                let raw: String = row.try_get(1)?;
                // Values are stored as JSON text; tolerate bare strings.
                let value = serde_json::from_str(&raw).unwrap_or(JsonValue::String(raw));
                values.insert(key, value);
            }
            anyhow::Ok(values)
        }
        .await;
        let values = match result {
            Err(e) if Self::is_missing_relation(&e) => {
                return Err(MetadataNotFound {
                    run_id: run_id.clone(),
                }
                .into())
            },
            other => other?,
        };
        if values.is_empty() {
            return Err(MetadataNotFound {
                run_id: run_id.clone(),
            }
            .into());
        }
        RunMetadata::from_values(run_id, values)
    }
}
