//! SQL for the per-run coordination schema.
//!
//! `@db_name` is substituted with the escaped schema name at prepare time.
//! Everything here is idempotent: the DDL runs on every `set_run` from every
//! instance (guarded by an in-process set, but instances race across
//! processes), so `IF NOT EXISTS` and `ON CONFLICT` do the heavy lifting.

pub(crate) const CREATE_SCHEMA_SQL: &str = r"CREATE SCHEMA IF NOT EXISTS @db_name;";

pub(crate) const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS @db_name.coordinator_batches (
    indexer_class TEXT NOT NULL,
    batch_filename TEXT NOT NULL,
    tick_start BIGINT NOT NULL,
    tick_end BIGINT NOT NULL,
    indexer_instance_id TEXT NOT NULL,
    claim_ts BIGINT NOT NULL,
    completion_ts BIGINT,
    status TEXT NOT NULL,
    error_message TEXT,
    PRIMARY KEY (indexer_class, batch_filename)
);
CREATE INDEX IF NOT EXISTS batches_by_class_status_tick_end
    ON @db_name.coordinator_batches (indexer_class, status, tick_end);
CREATE TABLE IF NOT EXISTS @db_name.coordinator_gaps (
    indexer_class TEXT NOT NULL,
    gap_start_tick BIGINT NOT NULL,
    gap_end_tick BIGINT NOT NULL,
    first_detected BIGINT NOT NULL,
    status TEXT NOT NULL,
    PRIMARY KEY (indexer_class, gap_start_tick)
);
CREATE TABLE IF NOT EXISTS @db_name.metadata (
    meta_key TEXT NOT NULL,
    meta_value TEXT NOT NULL,
    PRIMARY KEY (meta_key)
);
"#;

/// The atomic claim. The composite primary key makes the losing INSERT fail
/// with a unique violation, which the caller maps to `AlreadyClaimed`.
pub(crate) const TRY_CLAIM: &str = r#"
INSERT INTO @db_name.coordinator_batches
    (indexer_class, batch_filename, tick_start, tick_end, indexer_instance_id, claim_ts, status)
    VALUES ($1, $2, $3, $4, $5, $6, 'claimed')
"#;

pub(crate) const MARK_COMPLETED: &str = r#"
UPDATE @db_name.coordinator_batches
    SET status = 'completed', completion_ts = $3
    WHERE indexer_class = $1 AND batch_filename = $2
"#;

pub(crate) const MARK_FAILED: &str = r#"
UPDATE @db_name.coordinator_batches
    SET status = 'failed', error_message = $3
    WHERE indexer_class = $1 AND batch_filename = $2
"#;

/// Claimed rows count: an in-flight batch anchors gap detection.
pub(crate) const MAX_COMPLETED_TICK_END: &str = r#"
SELECT MAX(tick_end) FROM @db_name.coordinator_batches
    WHERE indexer_class = $1 AND status IN ('completed', 'claimed')
"#;

/// Concurrent detections of the same gap collapse to the first writer's row.
pub(crate) const RECORD_GAP: &str = r#"
INSERT INTO @db_name.coordinator_gaps
    (indexer_class, gap_start_tick, gap_end_tick, first_detected, status)
    VALUES ($1, $2, $3, $4, 'pending')
    ON CONFLICT (indexer_class, gap_start_tick) DO NOTHING
"#;

pub(crate) const OLDEST_PENDING_GAP: &str = r#"
SELECT gap_start_tick, gap_end_tick, first_detected, status
    FROM @db_name.coordinator_gaps
    WHERE indexer_class = $1 AND status = 'pending'
    ORDER BY gap_start_tick
    LIMIT 1
"#;

pub(crate) const MARK_GAP_PERMANENT: &str = r#"
UPDATE @db_name.coordinator_gaps
    SET status = 'permanent'
    WHERE indexer_class = $1 AND gap_start_tick = $2
"#;

/// First statement of the split transaction; the row lock serializes
/// concurrent splits of the same gap.
pub(crate) const LOCK_GAP: &str = r#"
SELECT gap_end_tick, status FROM @db_name.coordinator_gaps
    WHERE indexer_class = $1 AND gap_start_tick = $2
    FOR UPDATE
"#;

pub(crate) const DELETE_GAP: &str = r#"
DELETE FROM @db_name.coordinator_gaps
    WHERE indexer_class = $1 AND gap_start_tick = $2
"#;

/// Remainder insert during a split. Unlike `RECORD_GAP` the status is a
/// parameter: remainders of a permanent gap stay permanent.
pub(crate) const INSERT_GAP: &str = r#"
INSERT INTO @db_name.coordinator_gaps
    (indexer_class, gap_start_tick, gap_end_tick, first_detected, status)
    VALUES ($1, $2, $3, $4, $5)
"#;

pub(crate) const LIST_BATCHES: &str = r#"
SELECT batch_filename, indexer_instance_id, claim_ts, completion_ts, status, error_message
    FROM @db_name.coordinator_batches
    WHERE indexer_class = $1
    ORDER BY batch_filename
"#;

pub(crate) const LIST_GAPS: &str = r#"
SELECT gap_start_tick, gap_end_tick, first_detected, status
    FROM @db_name.coordinator_gaps
    WHERE indexer_class = $1
    ORDER BY gap_start_tick
"#;

pub(crate) const HAS_METADATA: &str = r#"
SELECT 1 FROM @db_name.metadata WHERE meta_key = $1
"#;

pub(crate) const GET_METADATA: &str = r#"
SELECT meta_key, meta_value FROM @db_name.metadata
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_schema_qualified() {
        for statement in [
            CREATE_SCHEMA_SQL,
            INIT_SQL,
            TRY_CLAIM,
            MARK_COMPLETED,
            MARK_FAILED,
            MAX_COMPLETED_TICK_END,
            RECORD_GAP,
            OLDEST_PENDING_GAP,
            MARK_GAP_PERMANENT,
            LOCK_GAP,
            DELETE_GAP,
            INSERT_GAP,
            LIST_BATCHES,
            LIST_GAPS,
            HAS_METADATA,
            GET_METADATA,
        ] {
            assert!(
                statement.contains("@db_name"),
                "statement is not schema-qualified: {statement}"
            );
        }
    }
}
