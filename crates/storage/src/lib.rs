//! Read side of the blob store holding immutable batch files.
//!
//! Batch files are published atomically by the persistence service (temp
//! file, fsync, rename), named so that lexicographic order over names equals
//! chronological order over tick ranges. Everything here only ever observes
//! fully published files; names that do not match the batch grammar are
//! skipped.

mod batch_format;
mod local;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::{
    fmt::Debug,
    time::SystemTime,
};

use async_trait::async_trait;
use common::types::{
    BatchFileName,
    RunId,
    TickRange,
    TickRecord,
};

pub use crate::{
    batch_format::{
        decode_batch,
        encode_batch,
    },
    local::LocalDirStorage,
};

/// One page of a batch file listing, in ascending filename order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchListPage {
    pub files: Vec<BatchFileName>,
    /// Pass back in to continue after the last file of this page. Carries the
    /// input token through when the page is empty.
    pub next_token: Option<String>,
}

/// A run prefix observed in the store, for run discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: RunId,
    pub first_seen: SystemTime,
}

#[async_trait]
pub trait BatchStorage: Send + Sync + Debug {
    /// Published batch files under `prefix` strictly after
    /// `continuation_token`, at most `max_count` of them.
    async fn list_batch_files(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_count: usize,
    ) -> anyhow::Result<BatchListPage>;

    /// Like [`list_batch_files`], additionally restricted to files whose
    /// tick range intersects `range`. Used by gap filling.
    ///
    /// [`list_batch_files`]: BatchStorage::list_batch_files
    async fn list_batch_files_in_range(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_count: usize,
        range: TickRange,
    ) -> anyhow::Result<BatchListPage>;

    /// The decoded tick records of one batch file.
    async fn read_batch(
        &self,
        prefix: &str,
        filename: &BatchFileName,
    ) -> anyhow::Result<Vec<TickRecord>>;

    /// Top-level run prefixes with their first-seen timestamps, for
    /// discovering the most recent run.
    async fn list_runs(&self) -> anyhow::Result<Vec<RunInfo>>;
}
