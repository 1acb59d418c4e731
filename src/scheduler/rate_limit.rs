//! Upstream (GitHub API) rate-limit backoff.
//!
//! Processors report rate-limit responses through the engine. While a
//! backoff is active the engine queues new work instead of dispatching it,
//! so all processors back off together.

use std::time::Duration;

use tokio::time::Instant;

/// Backoff cap in seconds: `2^6`.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Shared upstream backoff state.
#[derive(Debug, Default)]
pub struct UpstreamBackoff {
    /// When dispatching may resume (None = no active limit).
    backoff_until: Option<Instant>,
    /// Number of consecutive rate limit hits.
    consecutive_hits: u32,
    last_success: Option<Instant>,
}

impl UpstreamBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if we are currently backing off.
    pub fn is_backing_off(&self) -> bool {
        self.backoff_until.is_some_and(|until| Instant::now() < until)
    }

    /// Remaining backoff, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.backoff_until.and_then(|until| {
            let now = Instant::now();
            if now < until { Some(until - now) } else { None }
        })
    }

    pub fn consecutive_hits(&self) -> u32 {
        self.consecutive_hits
    }

    /// Record a rate-limit response.
    ///
    /// The delay is the larger of the upstream's suggested delay and
    /// `2^hits` seconds, capped at 64s.
    pub fn record_rate_limit(&mut self, retry_after: Option<Duration>) -> Duration {
        self.consecutive_hits += 1;

        let exp_backoff = Duration::from_secs(2u64.pow(self.consecutive_hits.min(MAX_BACKOFF_EXPONENT)));
        let delay = retry_after.unwrap_or_default().max(exp_backoff);
        self.backoff_until = Some(Instant::now() + delay);

        tracing::warn!(
            backoff_secs = delay.as_secs(),
            consecutive_hits = self.consecutive_hits,
            "Upstream rate limited, holding dispatches"
        );
        delay
    }

    /// Record a successful capture; clears the backoff.
    pub fn record_success(&mut self) {
        self.consecutive_hits = 0;
        self.backoff_until = None;
        self.last_success = Some(Instant::now());
    }

    pub fn time_since_success(&self) -> Option<Duration> {
        self.last_success.map(|t| t.elapsed())
    }
}

/// Whether an error message reports an upstream rate limit.
pub fn is_rate_limit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("secondary rate") || lower.contains("abuse detection")
}
