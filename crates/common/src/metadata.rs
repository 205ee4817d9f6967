//! Read side of the per-run metadata table populated by the metadata
//! indexer.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::types::RunId;

pub const SAMPLING_INTERVAL_KEY: &str = "samplingInterval";

/// Per-run constants. `sampling_interval` is the fixed stride between tick
/// numbers; everything else rides along untyped.
#[derive(Clone, Debug, PartialEq)]
pub struct RunMetadata {
    pub sampling_interval: i64,
    pub values: BTreeMap<String, JsonValue>,
}

impl RunMetadata {
    /// Validates and extracts the keys batch indexers depend on.
    pub fn from_values(
        run_id: &RunId,
        values: BTreeMap<String, JsonValue>,
    ) -> anyhow::Result<Self> {
        let sampling_interval = values
            .get(SAMPLING_INTERVAL_KEY)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                anyhow::anyhow!("run {run_id} metadata is missing an integer {SAMPLING_INTERVAL_KEY}")
            })?;
        anyhow::ensure!(
            sampling_interval > 0,
            "run {run_id} has nonpositive {SAMPLING_INTERVAL_KEY} {sampling_interval}"
        );
        Ok(Self {
            sampling_interval,
            values,
        })
    }
}

/// Non-blocking metadata lookups. Polling lives with the caller (the indexer
/// base), which owns the interval and deadline.
#[async_trait]
pub trait MetadataReader: Send + Sync {
    /// Whether the run's metadata table exists and contains
    /// `samplingInterval`.
    async fn has_metadata(&self, run_id: &RunId) -> anyhow::Result<bool>;

    /// The run's metadata. Fails with a downcastable
    /// [`MetadataNotFound`](crate::errors::MetadataNotFound) when absent.
    async fn get_metadata(&self, run_id: &RunId) -> anyhow::Result<RunMetadata>;
}
