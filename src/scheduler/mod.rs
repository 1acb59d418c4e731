//! Admission control for execution processors.
//!
//! This module provides:
//! - **Tiers**: per-deployment concurrency profiles (free/pro/enterprise).
//! - **ConcurrencyLimiter**: acquire/release slots with a burst allowance,
//!   cooldown window and a priority-ordered wait queue.
//! - **UpstreamBackoff**: coordinated backoff when GitHub rate-limits us.
//!
//! # Example
//!
//! ```ignore
//! use hubcapture::scheduler::{AdmissionRequest, AcquireOutcome, ConcurrencyLimiter, ConcurrencyTier};
//!
//! let limiter = ConcurrencyLimiter::new(Processor::Batch, ConcurrencyTier::pro(), dispatcher);
//! match limiter.acquire(AdmissionRequest::for_job(&job)).await {
//!     AcquireOutcome::Acquired => { limiter.dispatch(request).await; }
//!     AcquireOutcome::Queued { position, .. } => println!("queued at {}", position),
//!     AcquireOutcome::Rejected => println!("throttled"),
//! }
//! ```

mod limiter;
mod rate_limit;
mod tier;

pub use limiter::{
    AcquireOutcome, AdmissionRequest, ConcurrencyLimiter, DispatchOutcome, EXECUTION_SAMPLE_WINDOW, HealthReport,
    HealthStatus, LimiterMetrics, MAX_DISPATCH_ATTEMPTS,
};
pub use rate_limit::{UpstreamBackoff, is_rate_limit_error};
pub use tier::{ConcurrencyTier, TierName};
