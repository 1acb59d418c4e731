//! hubcapture - capture job routing and lifecycle engine
//!
//! Decides where GitHub activity capture jobs run, admits them under a
//! per-tier concurrency budget, tracks chunked historical backfills,
//! records job status and metrics, and resubmits transient failures.

pub mod backfill;
pub mod daemon;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod id;
pub mod placement;
pub mod reporter;
pub mod retry;
pub mod routing;
pub mod scheduler;
pub mod store;

pub use engine::{CaptureEngine, EngineConfig, FinishOutcome, SubmitOutcome, SubmitRequest};
pub use error::{CaptureError, Result};
