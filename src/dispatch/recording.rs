//! In-memory dispatcher that records submissions.
//!
//! Failures can be injected to exercise the limiter's redispatch handling.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::TaskDispatcher;
use crate::error::{CaptureError, Result};
use crate::store::JobType;

/// One accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedTask {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub correlation_id: String,
    pub external_id: String,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: Vec<DispatchedTask>,
    by_correlation: HashMap<String, String>,
    fail_next: usize,
    attempts: usize,
}

/// Records every submission in memory.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    inner: Mutex<Inner>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` submissions.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    pub fn tasks(&self) -> Vec<DispatchedTask> {
        self.lock().tasks.clone()
    }

    /// Job ids of accepted submissions, in order.
    pub fn job_ids(&self) -> Vec<String> {
        self.lock()
            .tasks
            .iter()
            .filter_map(|t| t.payload.get("job_id").and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    /// Submission attempts including failed ones.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn submit(&self, job_type: JobType, payload: serde_json::Value, correlation_id: &str) -> Result<String> {
        let mut inner = self.lock();
        inner.attempts += 1;

        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(CaptureError::Dispatch("injected failure".to_string()));
        }

        if let Some(existing) = inner.by_correlation.get(correlation_id) {
            return Ok(existing.clone());
        }

        let external_id = format!("run-{}", inner.tasks.len() + 1);
        inner
            .by_correlation
            .insert(correlation_id.to_string(), external_id.clone());
        inner.tasks.push(DispatchedTask {
            job_type,
            payload,
            correlation_id: correlation_id.to_string(),
            external_id: external_id.clone(),
        });
        Ok(external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_records_and_dedupes() {
        let dispatcher = RecordingDispatcher::new();
        let a = dispatcher
            .submit(JobType::Reviews, json!({"job_id": "j1"}), "c1")
            .await
            .unwrap();
        let b = dispatcher
            .submit(JobType::Reviews, json!({"job_id": "j1"}), "c1")
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(dispatcher.tasks().len(), 1);
        assert_eq!(dispatcher.job_ids(), vec!["j1".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let dispatcher = RecordingDispatcher::new();
        dispatcher.fail_next(1);
        assert!(dispatcher.submit(JobType::Reviews, json!({}), "c1").await.is_err());
        assert!(dispatcher.submit(JobType::Reviews, json!({}), "c1").await.is_ok());
        assert_eq!(dispatcher.attempts(), 2);
    }
}
