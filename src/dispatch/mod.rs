//! Collaborator seams between the engine and the outside world.
//!
//! - **TaskDispatcher**: hands a job payload to the execution fabric.
//! - **RepositoryProvider**: resolves repository metadata for routing.
//! - **NotificationSink**: one-way, best-effort user notifications.
//! - **JobSubmitter**: persists and schedules a new capture job; the retry
//!   service resubmits through it.
//!
//! The engine owns retries; dispatchers are expected to make a single
//! attempt and be idempotent per correlation id.

mod notify;
mod outbox;
mod recording;

use async_trait::async_trait;

use crate::error::Result;
use crate::store::{CaptureJob, CaptureStore, JobType, RepositoryRecord};

pub use notify::{LogNotifier, Notification, RecordingNotifier};
pub use outbox::OutboxDispatcher;
pub use recording::{DispatchedTask, RecordingDispatcher};

/// Submits capture work to an execution processor.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Submit a job, returning the fabric's id for it.
    ///
    /// Submitting again with the same `correlation_id` must not start a
    /// second execution.
    async fn submit(&self, job_type: JobType, payload: serde_json::Value, correlation_id: &str) -> Result<String>;
}

/// Looks up repository metadata.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    async fn get_repository(&self, repository_id: &str) -> Result<Option<RepositoryRecord>>;
}

/// Fire-and-forget notifications. Never read back.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn show_jobs_queued(&self, count: usize, kind: &str);

    async fn show_warning(&self, message: &str);
}

/// Accepts a fully-built job for routing and admission.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Persist and schedule `job`, returning its id.
    async fn submit_job(&self, job: CaptureJob) -> Result<String>;
}

#[async_trait]
impl RepositoryProvider for CaptureStore {
    async fn get_repository(&self, repository_id: &str) -> Result<Option<RepositoryRecord>> {
        CaptureStore::get_repository(self, repository_id)
    }
}
