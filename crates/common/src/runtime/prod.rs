//! Production [`Runtime`] backed by tokio.

use std::{
    future::Future,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    future::BoxFuture,
    FutureExt,
};
use rand::RngCore;

use super::{
    Runtime,
    SpawnHandle,
};

pub struct TokioSpawnHandle {
    name: &'static str,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TokioSpawnHandle {
    pub fn new(name: &'static str, handle: tokio::task::JoinHandle<()>) -> Self {
        Self {
            name,
            handle: Some(handle),
        }
    }
}

impl SpawnHandle for TokioSpawnHandle {
    fn shutdown(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    fn into_join_future(mut self: Box<Self>) -> BoxFuture<'static, anyhow::Result<()>> {
        let name = self.name;
        let handle = self.handle.take().expect("join future taken twice");
        async move {
            match handle.await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(anyhow::anyhow!("worker {name} panicked: {e}")),
            }
        }
        .boxed()
    }
}

/// Runtime for production use: real clocks, tokio sleeps, thread-local
/// entropy.
#[derive(Clone)]
pub struct ProdRuntime {
    handle: tokio::runtime::Handle,
}

impl ProdRuntime {
    pub fn new() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Runtime for ProdRuntime {
    fn wait(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(TokioSpawnHandle::new(name, self.handle.spawn(f)))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        Box::new(rand::rng())
    }
}
