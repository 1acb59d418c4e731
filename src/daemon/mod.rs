//! Daemon - the long-running capture process
//!
//! The daemon:
//! - Drains limiter queues on every tick (cooldowns expire without a release)
//! - Logs limiter health transitions
//! - Runs the auto-retry scan at start and then on its own interval
//!
//! It stops when the shutdown watch channel flips to `true`.

mod tick;

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::engine::CaptureEngine;
use crate::retry::RetryService;
use crate::scheduler::HealthStatus;

pub use tick::{TickConfig, TickResult, TickState};

pub struct Daemon {
    engine: Arc<CaptureEngine>,
    retry: Arc<RetryService>,
    config: TickConfig,
    state: TickState,
}

impl Daemon {
    pub fn new(engine: Arc<CaptureEngine>, retry: Arc<RetryService>, config: TickConfig) -> Self {
        Self {
            engine,
            retry,
            config,
            state: TickState::new(),
        }
    }

    pub fn state(&self) -> &TickState {
        &self.state
    }

    /// One pass: drain queues, then check limiter health.
    pub async fn tick(&mut self) -> TickResult {
        self.state.tick();
        if self.state.shutdown_requested {
            return TickResult::Shutdown;
        }

        let dispatched = self.engine.drain_queues().await;
        self.state.dispatched(dispatched);

        for report in self.engine.health().await {
            let processor = report.metrics.processor;
            if let Some(previous) = self.state.observe_health(processor, report.status) {
                match report.status {
                    HealthStatus::Healthy => info!("{} limiter recovered (was {})", processor, previous),
                    status => warn!(
                        "{} limiter {} (was {}): {} running, queue {}/{}, throttle rate {:.2}",
                        processor,
                        status,
                        previous,
                        report.metrics.current_concurrent,
                        report.metrics.queue_length,
                        report.metrics.queue_capacity,
                        report.metrics.throttle_rate()
                    ),
                }
            }
        }

        if dispatched > 0 {
            TickResult::Dispatched(dispatched)
        } else {
            TickResult::Idle
        }
    }

    /// Run one retry scan and fold it into the counters.
    pub async fn retry_scan(&mut self) {
        let report = self.retry.scan().await;
        self.state.record_scan(&report);
    }

    /// Tick until shutdown is signalled, returning the final counters.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> TickState {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retry_ticker = tokio::time::interval(self.config.retry_interval);
        retry_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Daemon started: tick every {:?}, retry scan every {:?}",
            self.config.tick_interval, self.config.retry_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.tick().await == TickResult::Shutdown {
                        break;
                    }
                }
                _ = retry_ticker.tick() => {
                    self.retry_scan().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.state.request_shutdown();
                        break;
                    }
                }
            }
        }

        info!(
            "Daemon stopped after {} ticks: {} dispatched, {} retried over {} scans",
            self.state.tick_count, self.state.total_dispatched, self.state.total_retried, self.state.retry_scans
        );
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{JobSubmitter, RecordingDispatcher, RepositoryProvider};
    use crate::engine::{EngineConfig, SubmitRequest};
    use crate::retry::RetryConfig;
    use crate::scheduler::{ConcurrencyTier, TierName};
    use crate::store::{CaptureStore, JobType, RepositoryRecord};
    use std::time::Duration;

    fn daemon(tier: ConcurrencyTier) -> (Daemon, Arc<CaptureEngine>, Arc<RecordingDispatcher>) {
        let store = Arc::new(CaptureStore::open_in_memory().unwrap());
        store
            .upsert_repository(&RepositoryRecord::new("repo-1", "octo", "hello", 10))
            .unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let engine = Arc::new(CaptureEngine::new(
            store.clone(),
            dispatcher.clone(),
            EngineConfig {
                tier,
                ..Default::default()
            },
        ));
        let repositories: Arc<dyn RepositoryProvider> = store.clone();
        let submitter: Arc<dyn JobSubmitter> = engine.clone();
        let retry = Arc::new(RetryService::new(RetryConfig::default(), store, repositories, submitter));
        let config = TickConfig::new(Duration::from_millis(10)).with_retry_interval(Duration::from_secs(60));
        (Daemon::new(engine.clone(), retry, config), engine, dispatcher)
    }

    #[tokio::test]
    async fn test_tick_drains_after_cooldown() {
        let tier = ConcurrencyTier {
            name: TierName::Free,
            max_concurrent: 2,
            burst_capacity: 3,
            cooldown: Duration::from_millis(30),
            queue_capacity: 10,
        };
        let (mut daemon, engine, dispatcher) = daemon(tier);

        // The second admission crosses 80% of 2 and arms the cooldown
        for _ in 0..2 {
            engine
                .submit(SubmitRequest::new(JobType::BackfillChunk, "repo-1"))
                .await
                .unwrap();
        }
        let held = engine
            .submit(SubmitRequest::new(JobType::BackfillChunk, "repo-1"))
            .await
            .unwrap();
        assert_eq!(dispatcher.attempts(), 2);
        assert_eq!(daemon.tick().await, TickResult::Idle);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(daemon.tick().await, TickResult::Dispatched(1));
        assert_eq!(dispatcher.job_ids()[2], held.job_id());
        assert_eq!(daemon.state().total_dispatched, 1);
    }

    #[tokio::test]
    async fn test_run_scans_immediately_and_stops_on_shutdown() {
        let (daemon, _, _) = daemon(ConcurrencyTier::free());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(daemon.run(rx));

        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(true).unwrap();
        let state = handle.await.unwrap();

        assert!(state.shutdown_requested);
        assert_eq!(state.retry_scans, 1);
        assert!(state.tick_count >= 1);
    }
}
