use std::{
    collections::BTreeSet,
    sync::Arc,
    time::Duration,
};

use common::coordinator::{
    BatchStatus,
    GapStatus,
};
use common::types::TickRange;

use super::{
    SlowProcessor,
    TestPipeline,
    INTERVAL,
};
use crate::config::IndexerConfig;

#[tokio::test(start_paused = true)]
async fn test_single_indexer_processes_contiguous_batches() -> anyhow::Result<()> {
    let pipeline = TestPipeline::new().await?;
    for n in 0..5 {
        pipeline.publish(n * 1000, n * 1000 + 990)?;
    }
    let config = IndexerConfig {
        flush_timeout: Duration::from_secs(2),
        ..pipeline.config()
    };
    let indexer = pipeline.indexer(config)?;
    indexer.start()?;

    pipeline
        .wait_until("five completed batches", || async {
            Ok(pipeline.completed_rows().await?.len() == 5)
        })
        .await;
    indexer.stop().await?;

    assert!(pipeline.gaps().await?.is_empty());
    let mut ticks = pipeline.processor.tick_numbers();
    ticks.sort();
    assert_eq!(ticks.len(), 500);
    assert_eq!(ticks.first(), Some(&0));
    assert_eq!(ticks.last(), Some(&4990));
    let status = indexer.status();
    assert_eq!(status.metrics.get("ticks_processed"), Some(&500.0));
    assert_eq!(status.metrics.get("batches_processed"), Some(&5.0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_competing_instances_split_the_backlog() -> anyhow::Result<()> {
    let pipeline = TestPipeline::new().await?;
    for n in 0..100 {
        pipeline.publish(n * 100, n * 100 + 90)?;
    }
    let config = IndexerConfig {
        buffering: false,
        ..pipeline.config()
    };
    let processor = Arc::new(SlowProcessor {
        rt: pipeline.rt.clone(),
        delay: Duration::from_millis(50),
        inner: pipeline.processor.clone(),
    });
    let indexers: Vec<_> = (0..3)
        .map(|_| pipeline.indexer_with_processor(config.clone(), processor.clone()))
        .collect::<anyhow::Result<_>>()?;
    for indexer in &indexers {
        indexer.start()?;
    }

    pipeline
        .wait_until("all 100 batches completed", || async {
            Ok(pipeline.completed_rows().await?.len() == 100)
        })
        .await;
    for indexer in &indexers {
        indexer.stop().await?;
    }

    let rows = pipeline.completed_rows().await?;
    // No two rows share a filename (primary key), and every instance won a
    // share of the backlog.
    let filenames: BTreeSet<_> = rows.iter().map(|r| r.filename.clone()).collect();
    assert_eq!(filenames.len(), 100);
    for indexer in &indexers {
        let share = rows
            .iter()
            .filter(|r| &r.instance_id == indexer.instance_id())
            .count();
        assert!(share > 0, "instance {} processed nothing", indexer.instance_id());
        assert!(share < 100, "instance {} processed everything", indexer.instance_id());
    }
    // Every tick was delivered exactly once.
    let mut ticks = pipeline.processor.tick_numbers();
    ticks.sort();
    let unique: BTreeSet<_> = ticks.iter().copied().collect();
    assert_eq!(ticks.len(), 1000);
    assert_eq!(unique.len(), 1000);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_late_batch_fills_gap_without_remainder() -> anyhow::Result<()> {
    let pipeline = TestPipeline::new().await?;
    pipeline.publish(0, 990)?;
    pipeline.publish(2000, 2990)?;
    pipeline.publish(3000, 3990)?;
    let config = IndexerConfig {
        buffering: false,
        gap_warning_timeout: Duration::from_secs(600),
        ..pipeline.config()
    };
    let indexer = pipeline.indexer(config)?;
    indexer.start()?;

    pipeline
        .wait_until("three completed and the gap recorded", || async {
            Ok(pipeline.completed_rows().await?.len() == 3
                && pipeline.gaps().await?.len() == 1)
        })
        .await;
    let gap = pipeline.gaps().await?[0];
    assert_eq!(gap.range, TickRange::new(1000, 1990)?);
    assert_eq!(gap.status, GapStatus::Pending);

    // The missing batch arrives late and is pulled in through the gap path.
    pipeline.publish(1000, 1990)?;
    pipeline
        .wait_until("gap filled", || async {
            Ok(pipeline.completed_rows().await?.len() == 4
                && pipeline.gaps().await?.is_empty())
        })
        .await;
    indexer.stop().await?;

    let mut ticks = pipeline.processor.tick_numbers();
    ticks.sort();
    assert_eq!(ticks, (0..=3990).step_by(INTERVAL as usize).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unfilled_gap_ages_into_permanent() -> anyhow::Result<()> {
    let pipeline = TestPipeline::new().await?;
    pipeline.publish(0, 990)?;
    pipeline.publish(3000, 3990)?;
    let config = IndexerConfig {
        buffering: false,
        gap_warning_timeout: Duration::from_secs(2),
        ..pipeline.config()
    };
    let indexer = pipeline.indexer(config)?;
    indexer.start()?;

    pipeline
        .wait_until("both batches completed", || async {
            Ok(pipeline.completed_rows().await?.len() == 2)
        })
        .await;
    pipeline
        .wait_until("gap declared permanent", || async {
            let gaps = pipeline.gaps().await?;
            Ok(gaps.len() == 1 && gaps[0].status == GapStatus::Permanent)
        })
        .await;
    indexer.stop().await?;

    let gaps = pipeline.gaps().await?;
    assert_eq!(gaps[0].range, TickRange::new(1000, 2990)?);
    // The pending -> permanent transition happened exactly once.
    assert_eq!(indexer.status().metrics.get("permanent_gaps"), Some(&1.0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_buffer_cuts_storage_batches_into_smaller_inserts() -> anyhow::Result<()> {
    let pipeline = TestPipeline::new().await?;
    // Two storage batches of 1000 ticks each.
    pipeline.publish(0, 9990)?;
    pipeline.publish(10_000, 19_990)?;
    let config = IndexerConfig {
        insert_batch_size: 500,
        flush_timeout: Duration::from_secs(600),
        ..pipeline.config()
    };
    let indexer = pipeline.indexer(config)?;
    indexer.start()?;

    pipeline
        .wait_until("both batches completed", || async {
            Ok(pipeline.completed_rows().await?.len() == 2)
        })
        .await;
    indexer.stop().await?;

    // Two inserts per storage batch.
    assert_eq!(pipeline.processor.invocations(), 4);
    assert_eq!(pipeline.processor.tick_numbers().len(), 2000);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_buffer_spans_storage_batches_for_bulk_inserts() -> anyhow::Result<()> {
    let pipeline = TestPipeline::new().await?;
    for n in 0i64..10 {
        let start = n * 10_000;
        pipeline.publish(start, start + 9990)?;
    }
    let config = IndexerConfig {
        insert_batch_size: 5000,
        flush_timeout: Duration::from_secs(600),
        ..pipeline.config()
    };
    let indexer = pipeline.indexer(config)?;
    indexer.start()?;

    pipeline
        .wait_until("all ten batches completed", || async {
            Ok(pipeline.completed_rows().await?.len() == 10)
        })
        .await;
    indexer.stop().await?;

    // 10_000 buffered ticks drained as exactly two bulk inserts; each file
    // was marked completed only after the flush containing its last tick.
    assert_eq!(pipeline.processor.invocations(), 2);
    assert_eq!(pipeline.processor.tick_numbers().len(), 10_000);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_without_duplicates() -> anyhow::Result<()> {
    let pipeline = TestPipeline::new().await?;
    for n in 0i64..10 {
        pipeline.publish(n * 1000, n * 1000 + 990)?;
    }
    let config = IndexerConfig {
        buffering: false,
        ..pipeline.config()
    };
    let processor = Arc::new(SlowProcessor {
        rt: pipeline.rt.clone(),
        delay: Duration::from_millis(50),
        inner: pipeline.processor.clone(),
    });

    let first = pipeline.indexer_with_processor(config.clone(), processor.clone())?;
    first.start()?;
    pipeline
        .wait_until("some progress before the restart", || async {
            Ok(pipeline.completed_rows().await?.len() >= 4)
        })
        .await;
    first.stop().await?;
    let completed_before = pipeline.completed_rows().await?.len();

    let second = pipeline.indexer_with_processor(config, processor)?;
    second.start()?;
    pipeline
        .wait_until("the rest of the backlog", || async {
            Ok(pipeline.completed_rows().await?.len() == 10)
        })
        .await;
    second.stop().await?;

    assert!(completed_before < 10);
    let mut ticks = pipeline.processor.tick_numbers();
    ticks.sort();
    let unique: BTreeSet<_> = ticks.iter().copied().collect();
    assert_eq!(ticks.len(), 1000, "every tick observed");
    assert_eq!(unique.len(), 1000, "no tick observed twice");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_publication_order_does_not_change_the_outcome() -> anyhow::Result<()> {
    for order in [vec![0i64, 1, 2, 3], vec![3, 0, 2, 1], vec![2, 3, 1, 0]] {
        let pipeline = TestPipeline::new().await?;
        let config = IndexerConfig {
            buffering: false,
            gap_warning_timeout: Duration::from_secs(600),
            ..pipeline.config()
        };
        let indexer = pipeline.indexer(config)?;
        indexer.start()?;
        for n in order {
            pipeline.publish(n * 1000, n * 1000 + 990)?;
            pipeline.rt.advance(Duration::from_millis(300)).await;
        }
        pipeline
            .wait_until("all four batches completed", || async {
                Ok(pipeline.completed_rows().await?.len() == 4
                    && pipeline.gaps().await?.is_empty())
            })
            .await;
        indexer.stop().await?;

        let filenames: BTreeSet<String> = pipeline
            .completed_rows()
            .await?
            .iter()
            .map(|r| r.filename.as_str().to_owned())
            .collect();
        let expected: BTreeSet<String> = (0..4)
            .map(|n| {
                common::types::BatchFileName::from_range(
                    TickRange::new(n * 1000, n * 1000 + 990).unwrap(),
                )
                .as_str()
                .to_owned()
            })
            .collect();
        assert_eq!(filenames, expected);
        assert!(pipeline
            .batch_rows()
            .await?
            .iter()
            .all(|r| r.status == BatchStatus::Completed));
    }
    Ok(())
}
