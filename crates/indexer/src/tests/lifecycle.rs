use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    errors::ErrorCode,
    runtime::testing::TestRuntime,
    shutdown::ShutdownSignal,
    testing::TestCoordinator,
    types::{
        IndexerClass,
        RunId,
    },
};
use storage::testing::TestStorage;

use super::{
    TestPipeline,
    INTERVAL,
};
use crate::{
    config::IndexerConfig,
    indexer::Indexer,
    processor::testing::CollectingProcessor,
    status::{
        BindingState,
        IndexerState,
        PORT_STORAGE,
    },
};

#[tokio::test(start_paused = true)]
async fn test_lifecycle_transitions_and_rejections() -> anyhow::Result<()> {
    let pipeline = TestPipeline::new().await?;
    pipeline.publish(0, 990)?;
    let indexer = pipeline.indexer(IndexerConfig {
        buffering: false,
        ..pipeline.config()
    })?;

    assert_eq!(indexer.state(), IndexerState::Stopped);
    assert!(indexer.pause().is_err(), "pause from stopped");
    assert!(indexer.resume().is_err(), "resume from stopped");

    indexer.start()?;
    assert!(indexer.start().is_err(), "start while running");
    pipeline
        .wait_until("first batch processed", || async {
            Ok(pipeline.completed_rows().await?.len() == 1)
        })
        .await;

    indexer.pause()?;
    assert!(indexer.pause().is_err(), "pause while pausing");
    pipeline
        .wait_until("worker observed the pause", || async {
            Ok(indexer.state() == IndexerState::Paused)
        })
        .await;
    assert!(indexer.stop().await.is_err(), "stop from paused");

    // Nothing moves while paused.
    pipeline.publish(1000, 1990)?;
    pipeline.rt.advance(Duration::from_secs(3)).await;
    assert_eq!(pipeline.completed_rows().await?.len(), 1);

    indexer.resume()?;
    assert!(indexer.resume().is_err(), "resume while running");
    pipeline
        .wait_until("processing resumed", || async {
            Ok(pipeline.completed_rows().await?.len() == 2)
        })
        .await;

    indexer.stop().await?;
    assert_eq!(indexer.state(), IndexerState::Stopped);
    assert!(indexer.pause().is_err(), "pause after stop");

    // A stopped indexer can be started again.
    indexer.start()?;
    pipeline
        .wait_until("running again", || async {
            Ok(indexer.state() == IndexerState::Running)
        })
        .await;
    indexer.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_metadata_times_out_into_error_state() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let class: IndexerClass = "organism".parse()?;
    let run: RunId = "run1".parse()?;
    let storage = TestStorage::new(rt.clone());
    storage.publish_range(&run.storage_prefix(), 0, 990, INTERVAL)?;
    // Deliberately no metadata for the run.
    let coordinator = TestCoordinator::new(rt.clone(), class.clone());
    let indexer = Indexer::new(
        rt.clone(),
        class,
        IndexerConfig {
            run_id: Some(run),
            poll_interval: Duration::from_millis(100),
            max_poll_duration: Duration::from_secs(2),
            ..IndexerConfig::default()
        },
        Arc::new(storage),
        Arc::new(coordinator.clone()),
        Arc::new(coordinator),
        Arc::new(CollectingProcessor::new()),
        ShutdownSignal::noop(),
    )?;
    indexer.start()?;

    for _ in 0..60 {
        if indexer.state() == IndexerState::Error {
            break;
        }
        rt.advance(Duration::from_millis(100)).await;
    }
    assert_eq!(indexer.state(), IndexerState::Error);
    let status = indexer.status();
    assert!(status
        .recent_errors
        .iter()
        .any(|e| e.code == ErrorCode::MetadataWaitTimeout));
    // ERROR is terminal.
    assert!(indexer.start().is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_run_discovery_blocks_until_a_run_appears() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let class: IndexerClass = "organism".parse()?;
    let run: RunId = "run1".parse()?;
    let storage = TestStorage::new(rt.clone());
    let coordinator = TestCoordinator::new(rt.clone(), class.clone());
    let processor = CollectingProcessor::new();
    let indexer = Indexer::new(
        rt.clone(),
        class,
        IndexerConfig {
            run_id: None,
            poll_interval: Duration::from_millis(100),
            buffering: false,
            ..IndexerConfig::default()
        },
        Arc::new(storage.clone()),
        Arc::new(coordinator.clone()),
        Arc::new(coordinator.clone()),
        Arc::new(processor.clone()),
        ShutdownSignal::noop(),
    )?;
    indexer.start()?;

    // No run yet; discovery just polls.
    rt.advance(Duration::from_secs(2)).await;
    assert!(processor.tick_numbers().is_empty());

    coordinator.set_sampling_interval(&run, INTERVAL);
    storage.publish_range(&run.storage_prefix(), 0, 990, INTERVAL)?;
    for _ in 0..100 {
        if processor.tick_numbers().len() == 100 {
            break;
        }
        rt.advance(Duration::from_millis(100)).await;
    }
    assert_eq!(processor.tick_numbers().len(), 100);
    indexer.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_run_discovery_picks_the_most_recent_run() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let class: IndexerClass = "organism".parse()?;
    let old_run: RunId = "run_old".parse()?;
    let new_run: RunId = "run_new".parse()?;
    let storage = TestStorage::new(rt.clone());
    let coordinator = TestCoordinator::new(rt.clone(), class.clone());

    storage.publish_range(&old_run.storage_prefix(), 0, 990, INTERVAL)?;
    rt.advance(Duration::from_secs(5)).await;
    storage.publish_range(&new_run.storage_prefix(), 0, 490, INTERVAL)?;
    coordinator.set_sampling_interval(&old_run, INTERVAL);
    coordinator.set_sampling_interval(&new_run, INTERVAL);

    let processor = CollectingProcessor::new();
    let indexer = Indexer::new(
        rt.clone(),
        class,
        IndexerConfig {
            run_id: None,
            poll_interval: Duration::from_millis(100),
            buffering: false,
            ..IndexerConfig::default()
        },
        Arc::new(storage),
        Arc::new(coordinator.clone()),
        Arc::new(coordinator.clone()),
        Arc::new(processor.clone()),
        ShutdownSignal::noop(),
    )?;
    indexer.start()?;

    for _ in 0..100 {
        if processor.tick_numbers().len() == 50 {
            break;
        }
        rt.advance(Duration::from_millis(100)).await;
    }
    // Only the most recently seen run was indexed.
    assert_eq!(processor.tick_numbers().len(), 50);
    indexer.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_storage_outage_marks_binding_failed_and_recovers() -> anyhow::Result<()> {
    let pipeline = TestPipeline::new().await?;
    pipeline.publish(0, 990)?;
    let indexer = pipeline.indexer(IndexerConfig {
        buffering: false,
        ..pipeline.config()
    })?;
    indexer.start()?;
    pipeline
        .wait_until("first batch processed", || async {
            Ok(pipeline.completed_rows().await?.len() == 1)
        })
        .await;

    // The binding flips back to ACTIVE only on a successful delivery, so the
    // FAILED observation below cannot race the recovery: there is nothing to
    // deliver until the next publish.
    pipeline.storage.inject_failures(3);
    pipeline
        .wait_until("storage binding failed", || async {
            let status = indexer.status();
            let storage_port = status
                .bindings
                .iter()
                .find(|b| b.port == PORT_STORAGE)
                .expect("storage port");
            Ok(storage_port.state == BindingState::Failed)
        })
        .await;
    let status = indexer.status();
    assert!(status
        .recent_errors
        .iter()
        .any(|e| e.code == ErrorCode::StorageUnavailable));
    assert!(status.metrics.get("iteration_failures").copied().unwrap_or(0.0) >= 1.0);

    // The injected failures drain and the loop recovers with backoff.
    pipeline.publish(1000, 1990)?;
    pipeline
        .wait_until("processing recovered", || async {
            Ok(pipeline.completed_rows().await?.len() == 2)
        })
        .await;
    let storage_state = indexer
        .status()
        .bindings
        .into_iter()
        .find(|b| b.port == PORT_STORAGE)
        .expect("storage port")
        .state;
    assert_eq!(storage_state, BindingState::Active);
    indexer.stop().await?;
    Ok(())
}
