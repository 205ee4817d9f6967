use std::sync::LazyLock;

use common::types::IndexerClass;
use prometheus::{
    register_int_counter_vec,
    IntCounterVec,
};

static BATCHES_PROCESSED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_batches_processed_total",
        "Batch files claimed, read, and handed to the processor or buffer",
        &["indexer_class"]
    )
    .unwrap()
});

static TICKS_PROCESSED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_ticks_processed_total",
        "Ticks successfully written by the processor",
        &["indexer_class"]
    )
    .unwrap()
});

static CLAIM_CONFLICTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_claim_conflicts_total",
        "Claim attempts lost to another instance",
        &["indexer_class"]
    )
    .unwrap()
});

static BATCH_READ_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_batch_read_failures_total",
        "Claimed batches that could not be read and were marked failed",
        &["indexer_class"]
    )
    .unwrap()
});

static PERMANENT_GAPS_DETECTED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_permanent_gaps_detected_total",
        "Pending gaps that aged out and were declared permanent",
        &["indexer_class"]
    )
    .unwrap()
});

static GAP_SPLITS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_gap_splits_total",
        "Gaps retired or narrowed after a batch landed inside them",
        &["indexer_class"]
    )
    .unwrap()
});

static SPLIT_GAP_CONFLICTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_split_gap_conflicts_total",
        "Gap splits skipped because the row vanished or changed under us",
        &["indexer_class"]
    )
    .unwrap()
});

static ITERATION_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_iteration_failures_total",
        "Loop iterations that surfaced an operational error",
        &["indexer_class"]
    )
    .unwrap()
});

static FLUSHES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "indexer_flushes_total",
        "Buffer flushes delivered to the processor",
        &["indexer_class"]
    )
    .unwrap()
});

fn inc(counter: &IntCounterVec, class: &IndexerClass, n: u64) {
    counter.with_label_values(&[class.as_str()]).inc_by(n);
}

pub fn log_batch_processed(class: &IndexerClass) {
    inc(&BATCHES_PROCESSED_TOTAL, class, 1);
}

pub fn log_ticks_processed(class: &IndexerClass, n: usize) {
    inc(&TICKS_PROCESSED_TOTAL, class, n as u64);
}

pub fn log_claim_conflict(class: &IndexerClass) {
    inc(&CLAIM_CONFLICTS_TOTAL, class, 1);
}

pub fn log_batch_read_failure(class: &IndexerClass) {
    inc(&BATCH_READ_FAILURES_TOTAL, class, 1);
}

pub fn log_permanent_gap(class: &IndexerClass) {
    inc(&PERMANENT_GAPS_DETECTED_TOTAL, class, 1);
}

pub fn log_gap_split(class: &IndexerClass) {
    inc(&GAP_SPLITS_TOTAL, class, 1);
}

pub fn log_split_gap_conflict(class: &IndexerClass) {
    inc(&SPLIT_GAP_CONFLICTS_TOTAL, class, 1);
}

pub fn log_iteration_failure(class: &IndexerClass) {
    inc(&ITERATION_FAILURES_TOTAL, class, 1);
}

pub fn log_flush(class: &IndexerClass) {
    inc(&FLUSHES_TOTAL, class, 1);
}
