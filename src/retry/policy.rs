//! Failure classification and backoff.

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{CaptureError, Result};

/// Upstream error fragments that make a failure permanent.
pub const PERMANENT_FAILURE_PATTERNS: &[&str] = &[
    "repository not found",
    "invalid repository format",
    "unauthorized",
    "rate limit exceeded",
    "repository is private",
    "repository is archived",
];

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the delay
    pub jitter: f64,
    /// Only jobs created within this window are scanned
    pub lookback: Duration,
    pub interval: Duration,
    pub stats_window: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.3,
            lookback: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(5 * 60),
            stats_window: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl RetryConfig {
    /// Reject settings the scan loop or the backoff cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(CaptureError::Config("retry interval must be positive".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(CaptureError::Config(format!(
                "retry backoff_multiplier {} is below 1",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CaptureError::Config(format!("retry jitter {} is outside [0, 1]", self.jitter)));
        }
        Ok(())
    }
}

/// How a failure should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Matched a known permanent pattern
    Permanent(&'static str),
    Transient,
}

/// Classify an error message by case-insensitive substring match.
///
/// Anything unrecognized, including a missing message and timeouts, is
/// transient.
pub fn classify(error: Option<&str>) -> FailureClass {
    let Some(error) = error else {
        return FailureClass::Transient;
    };
    let lower = error.to_lowercase();
    PERMANENT_FAILURE_PATTERNS
        .iter()
        .find(|pattern| lower.contains(**pattern))
        .map(|pattern| FailureClass::Permanent(*pattern))
        .unwrap_or(FailureClass::Transient)
}

/// `base * multiplier^retry_count`, stretched by up to `jitter` of itself.
///
/// `jitter_sample` is in `[0, 1]`.
pub fn backoff_delay(config: &RetryConfig, retry_count: u32, jitter_sample: f64) -> Duration {
    let exponent = retry_count.min(i32::MAX as u32) as i32;
    let base = config.base_delay.as_millis() as f64 * config.backoff_multiplier.powi(exponent);
    let stretched = base * (1.0 + config.jitter * jitter_sample.clamp(0.0, 1.0));
    Duration::from_millis(stretched.round() as u64)
}

/// Jitter sample fixed per job and attempt, so repeated scans agree on
/// when a job becomes due.
pub fn jitter_sample(job_id: &str, retry_count: u32) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(retry_count.to_le_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}
