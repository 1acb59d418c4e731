//! Outbox-table dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::TaskDispatcher;
use crate::error::{CaptureError, Result};
use crate::store::{CaptureStore, JobType};

/// Dispatches by writing to the `dispatch_outbox` table.
///
/// The execution fabric polls the outbox. A repeated correlation id leaves
/// the first row in place and returns the job id it was stored with.
pub struct OutboxDispatcher {
    store: Arc<CaptureStore>,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<CaptureStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskDispatcher for OutboxDispatcher {
    async fn submit(&self, job_type: JobType, payload: serde_json::Value, correlation_id: &str) -> Result<String> {
        let job_id = payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CaptureError::Dispatch("payload is missing job_id".to_string()))?
            .to_string();

        let stored = self
            .store
            .enqueue_outbox(correlation_id, &job_id, job_type.as_str(), &payload)?;
        debug!("Outbox accepted {} for job {} ({})", correlation_id, stored, job_type);
        Ok(stored)
    }
}
