//! Job status and metrics reporter.
//!
//! Records lifecycle transitions, per-job progress, and derived metrics, and
//! pushes status changes to per-job subscribers.
//!
//! Reporting is best-effort: failures are logged and returned to the caller,
//! who decides whether to care. Nothing here rolls back capture work.

mod subscriptions;

use std::sync::Arc;

use crate::error::Result;
use crate::id::now_ms;
use crate::store::{CaptureJob, CaptureStore, JobMetrics, JobProgress, JobStatus, MetadataPatch, WorkflowInfo};

pub use subscriptions::{JobSubscription, JobUpdate, SubscriptionHandle};

use subscriptions::Registry;

/// A status transition to record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub job_id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub metadata: MetadataPatch,
}

impl StatusUpdate {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            error: None,
            metadata: MetadataPatch::default(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataPatch) -> Self {
        self.metadata = metadata;
        self
    }
}

pub struct StatusReporter {
    store: Arc<CaptureStore>,
    registry: Arc<Registry>,
}

impl StatusReporter {
    pub fn new(store: Arc<CaptureStore>) -> Self {
        Self {
            store,
            registry: Arc::new(Registry::default()),
        }
    }

    /// Apply a status transition.
    ///
    /// `started_at` is set the first time a job enters `processing`;
    /// `completed_at` on every finished status. Metadata is merged.
    /// Transitions are not validated.
    pub async fn report_status(&self, update: StatusUpdate) -> Result<CaptureJob> {
        let result = self.store.apply_status(
            &update.job_id,
            update.status,
            update.error.as_deref(),
            update.metadata,
            now_ms(),
        );

        match result {
            Ok(job) => {
                tracing::debug!(job_id = %job.id, status = %job.status, "Status recorded");
                self.registry.publish(JobUpdate::from_job(&job));
                Ok(job)
            }
            Err(e) => {
                tracing::error!(job_id = %update.job_id, status = %update.status, error = %e, "Failed to record status");
                Err(e)
            }
        }
    }

    /// Record that a job reached the execution fabric.
    pub async fn record_dispatch(&self, job_id: &str, correlation_id: &str, external_id: &str) -> Result<CaptureJob> {
        let patch = MetadataPatch {
            workflow: Some(WorkflowInfo {
                correlation_id: correlation_id.to_string(),
                external_id: external_id.to_string(),
                dispatched_at: now_ms(),
            }),
            ..Default::default()
        };
        self.store.merge_metadata(job_id, patch).inspect_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record dispatch");
        })
    }

    /// Upsert progress counters for a job.
    pub async fn update_progress(&self, job_id: &str, progress: JobProgress) -> Result<()> {
        self.store.upsert_progress(job_id, &progress).inspect_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record progress");
        })
    }

    /// Derive and store execution metrics under the job's `metrics` key.
    ///
    /// Recomputed from stored timestamps and progress each time, so repeated
    /// calls write the same value.
    pub async fn calculate_metrics(&self, job_id: &str) -> Result<JobMetrics> {
        self.store_metrics(job_id).inspect_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to calculate metrics");
        })
    }

    fn store_metrics(&self, job_id: &str) -> Result<JobMetrics> {
        let job = self.store.require_job(job_id)?;
        let progress = self.store.get_progress(job_id)?.unwrap_or_default();
        let metrics = derive_metrics(&job, &progress);
        self.store.merge_metadata(
            job_id,
            MetadataPatch {
                metrics: Some(metrics.clone()),
                ..Default::default()
            },
        )?;
        Ok(metrics)
    }

    /// Subscribe to status changes of one job.
    pub fn subscribe(&self, job_id: &str) -> JobSubscription {
        Registry::subscribe(&self.registry, job_id)
    }

    /// Call `callback` for every status change of one job until the returned
    /// handle is dropped or unsubscribed.
    pub fn subscribe_with<F>(&self, job_id: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(JobUpdate) + Send + 'static,
    {
        let JobSubscription { mut receiver, handle } = self.subscribe(job_id);
        tokio::spawn(async move {
            while let Some(update) = receiver.recv().await {
                callback(update);
            }
        });
        handle
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.registry.count(job_id)
    }
}

fn derive_metrics(job: &CaptureJob, progress: &JobProgress) -> JobMetrics {
    let duration_ms = match (job.started_at, job.completed_at) {
        (Some(start), Some(end)) => Some((end - start).max(0)),
        _ => None,
    };
    let avg_item_ms = match duration_ms {
        Some(duration) if progress.processed > 0 => Some(duration as f64 / progress.processed as f64),
        _ => None,
    };

    JobMetrics {
        duration_ms,
        items_processed: progress.processed,
        items_failed: progress.failed,
        avg_item_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobType;
    use std::sync::Mutex;
    use std::time::Duration;

    fn setup() -> (StatusReporter, Arc<CaptureStore>, CaptureJob) {
        let store = Arc::new(CaptureStore::open_in_memory().unwrap());
        let job = CaptureJob::new(JobType::RecentSync, "repo-1");
        store.insert_job(&job).unwrap();
        (StatusReporter::new(store.clone()), store, job)
    }

    #[tokio::test]
    async fn test_report_status_lifecycle() {
        let (reporter, _, job) = setup();

        let processing = reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Processing))
            .await
            .unwrap();
        let started = processing.started_at.unwrap();

        let again = reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Processing))
            .await
            .unwrap();
        assert_eq!(again.started_at, Some(started));

        let failed = reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Failed).with_error("timeout"))
            .await
            .unwrap();
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_report_status_merges_metadata() {
        let (reporter, store, job) = setup();
        reporter
            .report_status(
                StatusUpdate::new(&job.id, JobStatus::Processing)
                    .with_metadata(MetadataPatch::extra("worker", serde_json::json!("w1"))),
            )
            .await
            .unwrap();
        reporter
            .report_status(
                StatusUpdate::new(&job.id, JobStatus::Completed)
                    .with_metadata(MetadataPatch::extra("items", serde_json::json!(3))),
            )
            .await
            .unwrap();

        let stored = store.require_job(&job.id).unwrap();
        assert_eq!(stored.metadata.extra["worker"], "w1");
        assert_eq!(stored.metadata.extra["items"], 3);
    }

    #[tokio::test]
    async fn test_transitions_are_not_validated() {
        let (reporter, _, job) = setup();
        reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Completed))
            .await
            .unwrap();
        let back = reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Processing))
            .await
            .unwrap();
        assert_eq!(back.status, JobStatus::Processing);
        assert!(back.started_at.is_some());
    }

    #[tokio::test]
    async fn test_report_missing_job_surfaces_error() {
        let (reporter, _, _) = setup();
        let err = reporter
            .report_status(StatusUpdate::new("missing", JobStatus::Processing))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_calculate_metrics_is_idempotent() {
        let (reporter, store, job) = setup();
        store
            .apply_status(&job.id, JobStatus::Processing, None, MetadataPatch::default(), 1_000)
            .unwrap();
        store
            .apply_status(&job.id, JobStatus::Completed, None, MetadataPatch::default(), 5_000)
            .unwrap();
        reporter
            .update_progress(
                &job.id,
                JobProgress {
                    total: 10,
                    processed: 8,
                    failed: 2,
                },
            )
            .await
            .unwrap();

        let first = reporter.calculate_metrics(&job.id).await.unwrap();
        let second = reporter.calculate_metrics(&job.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.duration_ms, Some(4_000));
        assert_eq!(first.items_processed, 8);
        assert_eq!(first.items_failed, 2);
        assert_eq!(first.avg_item_ms, Some(500.0));

        let stored = store.require_job(&job.id).unwrap();
        assert_eq!(stored.metadata.metrics, Some(first));
    }

    #[tokio::test]
    async fn test_metrics_without_timestamps() {
        let (reporter, _, job) = setup();
        let metrics = reporter.calculate_metrics(&job.id).await.unwrap();
        assert_eq!(metrics.duration_ms, None);
        assert_eq!(metrics.avg_item_ms, None);
        assert_eq!(metrics.items_processed, 0);
    }

    #[tokio::test]
    async fn test_subscription_receives_updates() {
        let (reporter, _, job) = setup();
        let mut subscription = reporter.subscribe(&job.id);

        reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Processing))
            .await
            .unwrap();
        reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Completed))
            .await
            .unwrap();

        assert_eq!(subscription.recv().await.unwrap().status, JobStatus::Processing);
        assert_eq!(subscription.recv().await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_updates() {
        let (reporter, _, job) = setup();
        let subscription = reporter.subscribe(&job.id);
        assert_eq!(reporter.subscriber_count(&job.id), 1);

        drop(subscription);
        assert_eq!(reporter.subscriber_count(&job.id), 0);

        reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Processing))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_with_callback() {
        let (reporter, _, job) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = reporter.subscribe_with(&job.id, move |update| {
            sink.lock().unwrap().push(update.status);
        });

        reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Processing))
            .await
            .unwrap();

        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![JobStatus::Processing]);

        handle.unsubscribe();
        assert_eq!(reporter.subscriber_count(&job.id), 0);
    }

    #[tokio::test]
    async fn test_updates_are_per_job() {
        let (reporter, store, job) = setup();
        let other = CaptureJob::new(JobType::Reviews, "repo-2");
        store.insert_job(&other).unwrap();

        let mut subscription = reporter.subscribe(&other.id);
        reporter
            .report_status(StatusUpdate::new(&job.id, JobStatus::Processing))
            .await
            .unwrap();
        assert!(subscription.try_recv().is_none());
    }
}
