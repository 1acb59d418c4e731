//! Tick loop bookkeeping.
//!
//! Each tick drains limiter queues and checks limiter health; retry scans
//! are folded into the same counters.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::retry::RetryScanReport;
use crate::scheduler::HealthStatus;
use crate::store::Processor;

/// Configuration for the daemon tick loop
#[derive(Debug, Clone, PartialEq)]
pub struct TickConfig {
    /// Interval between queue drains
    pub tick_interval: Duration,
    /// Interval between retry scans
    pub retry_interval: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl TickConfig {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            ..Default::default()
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Both intervals drive `tokio::time::interval`, which needs a non-zero period.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(CaptureError::Config("daemon tick interval must be positive".into()));
        }
        if self.retry_interval.is_zero() {
            return Err(CaptureError::Config("retry interval must be positive".into()));
        }
        Ok(())
    }
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickResult {
    /// Nothing was waiting or nothing could be admitted
    Idle,
    /// Queued requests were dispatched
    Dispatched(usize),
    Shutdown,
}

/// Counters kept across ticks
#[derive(Debug, Default)]
pub struct TickState {
    pub tick_count: u64,
    pub total_dispatched: u64,
    pub retry_scans: u64,
    pub total_retried: u64,
    pub total_permanent: u64,
    pub total_exhausted: u64,
    pub retry_errors: u64,
    pub shutdown_requested: bool,
    health: HashMap<Processor, HealthStatus>,
}

impl TickState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) {
        self.tick_count += 1;
    }

    pub fn dispatched(&mut self, count: usize) {
        self.total_dispatched += count as u64;
    }

    /// Fold one retry scan into the totals.
    pub fn record_scan(&mut self, report: &RetryScanReport) {
        self.retry_scans += 1;
        self.total_retried += report.retried.len() as u64;
        self.total_permanent += report.permanent.len() as u64;
        self.total_exhausted += report.exhausted.len() as u64;
        self.retry_errors += report.errors.len() as u64;
    }

    /// Remember a processor's health. Returns the previous status when it changed.
    ///
    /// The first observation counts as a change from `Healthy`.
    pub fn observe_health(&mut self, processor: Processor, status: HealthStatus) -> Option<HealthStatus> {
        let previous = self.health.insert(processor, status).unwrap_or(HealthStatus::Healthy);
        (previous != status).then_some(previous)
    }

    pub fn health(&self, processor: Processor) -> Option<HealthStatus> {
        self.health.get(&processor).copied()
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_config_rejects_zero_intervals() {
        assert!(TickConfig::default().validate().is_ok());
        assert!(TickConfig::new(Duration::ZERO).validate().is_err());
        let config = TickConfig::default().with_retry_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_config_default() {
        let config = TickConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.retry_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_tick_config_builder() {
        let config = TickConfig::new(Duration::from_millis(200)).with_retry_interval(Duration::from_secs(10));
        assert_eq!(config.tick_interval, Duration::from_millis(200));
        assert_eq!(config.retry_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_tick_state_counts() {
        let mut state = TickState::new();
        state.tick();
        state.tick();
        state.dispatched(3);
        assert_eq!(state.tick_count, 2);
        assert_eq!(state.total_dispatched, 3);
    }

    #[test]
    fn test_record_scan() {
        let mut state = TickState::new();
        let report = RetryScanReport {
            scanned: 4,
            retried: vec![("a".into(), "b".into())],
            permanent: vec!["c".into()],
            exhausted: vec!["d".into(), "e".into()],
            ..Default::default()
        };
        state.record_scan(&report);
        state.record_scan(&RetryScanReport::default());

        assert_eq!(state.retry_scans, 2);
        assert_eq!(state.total_retried, 1);
        assert_eq!(state.total_permanent, 1);
        assert_eq!(state.total_exhausted, 2);
    }

    #[test]
    fn test_health_transitions() {
        let mut state = TickState::new();
        assert_eq!(state.observe_health(Processor::Batch, HealthStatus::Healthy), None);
        assert_eq!(
            state.observe_health(Processor::Batch, HealthStatus::Degraded),
            Some(HealthStatus::Healthy)
        );
        assert_eq!(state.observe_health(Processor::Batch, HealthStatus::Degraded), None);
        assert_eq!(state.health(Processor::Batch), Some(HealthStatus::Degraded));
        assert_eq!(state.health(Processor::LowLatency), None);
    }

    #[test]
    fn test_request_shutdown() {
        let mut state = TickState::new();
        assert!(!state.shutdown_requested);
        state.request_shutdown();
        assert!(state.shutdown_requested);
    }
}
