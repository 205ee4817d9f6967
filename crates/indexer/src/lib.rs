//! The indexer coordination core: competing indexer instances drain batch
//! files from the blob store, coordinate claims and gap repair through the
//! coordinator store, buffer ticks across batch boundaries, and hand them to
//! a per-class processor.
//!
//! Construction is plain composition, leaves first:
//!
//! ```text
//! coordinator = PostgresCoordinator::new(rt, pool, class)
//! tracker     = GapTracker::new(rt, coordinator, storage, ...)
//! indexer     = Indexer::new(rt, config, storage, coordinator, metadata, processor, ...)
//! ```

mod config;
mod gap_tracker;
mod indexer;
mod metrics;
mod processor;
mod status;
#[cfg(test)]
mod tests;
mod tick_buffer;
mod worker;

pub use crate::{
    config::IndexerConfig,
    gap_tracker::{
        FillAttempt,
        GapTracker,
    },
    indexer::{
        Indexer,
        SchemaPreparer,
    },
    processor::TickProcessor,
    status::{
        BindingState,
        IndexerState,
        IndexerStatus,
        PortStatus,
        PORT_COORDINATOR,
        PORT_METADATA,
        PORT_STORAGE,
    },
    tick_buffer::TickBuffer,
};
#[cfg(any(test, feature = "testing"))]
pub use crate::processor::testing::CollectingProcessor;
