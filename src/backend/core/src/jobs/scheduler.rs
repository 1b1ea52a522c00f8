//! Periodic driver for the queue engine.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::engine::QueueEngine;
use crate::config::SchedulerConfig;

/// Runs `process_batch` every `poll_interval`, `recover_stale` every
/// `recovery_interval` and `cleanup` every `cleanup_interval` on one
/// background task.
pub struct QueueScheduler {
    engine: Arc<QueueEngine>,
    config: SchedulerConfig,
}

/// Handle for stopping a running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the scheduler and wait for the in-flight batch to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Scheduler task failed");
        }
    }
}

impl QueueScheduler {
    pub fn new(engine: Arc<QueueEngine>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let Self { engine, config } = self;

        let task = tokio::spawn(async move {
            let mut batch_tick = interval(config.poll_interval);
            batch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cleanup_tick = interval(config.cleanup_interval);
            cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut recovery_tick = interval(config.recovery_interval);
            recovery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                poll_interval = ?config.poll_interval,
                cleanup_interval = ?config.cleanup_interval,
                recovery_interval = ?config.recovery_interval,
                "Queue scheduler started"
            );

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = batch_tick.tick() => {
                        let report = engine.process_batch().await;
                        if report.fetched > 0 || report.errors > 0 {
                            tracing::info!(
                                fetched = report.fetched,
                                completed = report.completed,
                                retried = report.retried,
                                dead_lettered = report.dead_lettered,
                                skipped = report.skipped,
                                errors = report.errors,
                                "Batch processed"
                            );
                        }
                    }
                    _ = recovery_tick.tick() => {
                        engine.recover_stale().await;
                    }
                    _ = cleanup_tick.tick() => {
                        engine.cleanup().await;
                    }
                }
            }

            tracing::info!("Queue scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::jobs::events::{EventDispatcher, TracingEventSink};
    use crate::jobs::job::{JobPriority, JobStatus};
    use crate::jobs::payload::{ResearchPayload, ResearchRequest};
    use crate::jobs::retry::RetryPolicy;
    use crate::research::{RequestFailure, ResearchClient, ResearchReport};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ResearchClient for Echo {
        async fn perform(
            &self,
            payload: &ResearchPayload,
            _timeout: Duration,
        ) -> Result<ResearchReport, RequestFailure> {
            Ok(ResearchReport::new(payload.query.clone()))
        }
    }

    #[tokio::test]
    async fn test_scheduler_drains_queue_and_stops() {
        let (events, drain) = EventDispatcher::spawn(Arc::new(TracingEventSink), 64);
        let engine = Arc::new(QueueEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Echo),
            events,
            QueueConfig::default(),
            RetryPolicy::default(),
        ));
        let receipt = engine
            .enqueue("u1", &ResearchRequest::new("q"), JobPriority::Normal, Default::default())
            .await
            .unwrap();

        let config = SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let handle = QueueScheduler::new(engine.clone(), config).start();

        let mut status = JobStatus::Pending;
        for _ in 0..50 {
            status = engine.get_job(receipt.job_id).await.unwrap().status;
            if status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, JobStatus::Completed);

        handle.shutdown().await;
        drain.shutdown().await;
    }
}
