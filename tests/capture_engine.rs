//! End-to-end capture flow tests
//!
//! Exercises the engine, retry service and placement sync together against
//! an on-disk store.

use std::sync::Arc;
use std::time::Duration;

use hubcapture::dispatch::{JobSubmitter, OutboxDispatcher, RecordingDispatcher, RepositoryProvider};
use hubcapture::engine::{CaptureEngine, EngineConfig, FinishOutcome, SubmitOutcome, SubmitRequest};
use hubcapture::error::Result;
use hubcapture::placement::PlacementSync;
use hubcapture::retry::{RetryConfig, RetryService};
use hubcapture::scheduler::ConcurrencyTier;
use hubcapture::store::{CaptureStore, JobFilter, JobStatus, JobType, PriorityClass, RepositoryRecord};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Result<Arc<CaptureStore>> {
    Ok(Arc::new(CaptureStore::open(&dir.path().join("capture.db"))?))
}

fn seed(store: &CaptureStore) -> Result<()> {
    store.upsert_repository(&RepositoryRecord::new("repo-ws", "octo", "workspace", 40))?;
    store.upsert_repository(&RepositoryRecord::new("repo-plain", "octo", "plain", 40))?;
    Ok(())
}

fn retry_service(store: Arc<CaptureStore>, engine: Arc<CaptureEngine>) -> RetryService {
    let config = RetryConfig {
        base_delay: Duration::ZERO,
        ..Default::default()
    };
    let repositories: Arc<dyn RepositoryProvider> = store.clone();
    let submitter: Arc<dyn JobSubmitter> = engine;
    RetryService::new(config, store, repositories, submitter)
}

fn engine(store: Arc<CaptureStore>, dispatcher: Arc<RecordingDispatcher>) -> Arc<CaptureEngine> {
    let config = EngineConfig {
        tier: ConcurrencyTier::pro(),
        ..Default::default()
    };
    Arc::new(CaptureEngine::new(store, dispatcher, config).with_redispatch_delay(Duration::from_millis(1)))
}

/// A transient failure is resubmitted as a new job, which then completes.
#[tokio::test]
async fn test_failed_job_is_retried_and_counted() -> Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir)?;
    seed(&store)?;
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let engine = engine(store.clone(), dispatcher.clone());
    let retry = retry_service(store.clone(), engine.clone());

    let submitted = engine
        .submit(SubmitRequest::new(JobType::PrDetails, "repo-plain").with_time_range(3.0))
        .await?;
    let original_id = submitted.job_id().to_string();
    engine.start(&original_id).await?;
    engine
        .finish(&original_id, FinishOutcome::failed("upstream timeout"), Duration::from_millis(10))
        .await?;

    let report = retry.scan().await;
    assert_eq!(report.retried.len(), 1);
    let (from, replacement_id) = &report.retried[0];
    assert_eq!(from, &original_id);
    assert_eq!(dispatcher.job_ids(), vec![original_id.clone(), replacement_id.clone()]);

    let original = store.require_job(&original_id)?;
    assert_eq!(original.status, JobStatus::Failed);
    assert_eq!(original.retry_count, 1);
    assert!(original.metadata.retry.retried);
    assert_eq!(original.metadata.retry.history.len(), 1);

    let replacement = store.require_job(replacement_id)?;
    assert_eq!(replacement.metadata.retry_of.as_deref(), Some(original_id.as_str()));
    assert_eq!(replacement.metadata.time_range_days, Some(3.0));
    assert_eq!(replacement.retry_count, 1);
    assert_eq!(replacement.repository_name.as_deref(), Some("octo/plain"));

    // Already retried: a second scan leaves it alone
    let again = retry.scan().await;
    assert!(again.retried.is_empty());
    assert_eq!(again.skipped, 1);

    engine.start(replacement_id).await?;
    engine
        .finish(replacement_id, FinishOutcome::completed(12, 0), Duration::from_millis(10))
        .await?;

    let stats = retry.stats()?;
    assert_eq!(stats.total_retries, 1);
    assert_eq!(stats.successful_retries, 1);
    assert_eq!(stats.failed_retries, 0);
    Ok(())
}

/// Permanent upstream errors go straight to dead letter.
#[tokio::test]
async fn test_permanent_failure_is_dead_lettered() -> Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir)?;
    seed(&store)?;
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let engine = engine(store.clone(), dispatcher.clone());
    let retry = retry_service(store.clone(), engine.clone());

    let submitted = engine.submit(SubmitRequest::new(JobType::Reviews, "repo-plain")).await?;
    engine
        .finish(
            submitted.job_id(),
            FinishOutcome::failed("Repository is archived"),
            Duration::from_millis(5),
        )
        .await?;

    let report = retry.scan().await;
    assert_eq!(report.permanent, vec![submitted.job_id().to_string()]);
    assert!(report.retried.is_empty());
    assert_eq!(store.require_job(submitted.job_id())?.status, JobStatus::DeadLetter);
    assert_eq!(retry.stats()?.permanent_failures, 1);

    let history = store.list_jobs(&JobFilter::default().with_status(JobStatus::DeadLetter))?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].last_error.as_deref(), Some("Repository is archived"));
    Ok(())
}

/// Workspace placement raises the derived priority of new jobs.
#[tokio::test]
async fn test_placement_sync_feeds_priority() -> Result<()> {
    let dir = TempDir::new()?;
    let store = open_store(&dir)?;
    seed(&store)?;
    store.add_workspace_repository("ws-1", "repo-ws")?;

    let sync = PlacementSync::new(store.clone());
    let first = sync.full_sync()?;
    assert_eq!(first.promoted, vec!["repo-ws".to_string()]);
    assert_eq!(sync.full_sync()?.writes, 0);

    let engine = engine(store.clone(), Arc::new(RecordingDispatcher::new()));
    let workspace_job = engine.submit(SubmitRequest::new(JobType::Comments, "repo-ws")).await?;
    let plain_job = engine.submit(SubmitRequest::new(JobType::Comments, "repo-plain")).await?;

    let workspace_priority = store.require_job(workspace_job.job_id())?.priority;
    let plain_priority = store.require_job(plain_job.job_id())?.priority;
    assert_eq!(workspace_priority, PriorityClass::High);
    assert_eq!(plain_priority, PriorityClass::Medium);
    Ok(())
}

/// The outbox dispatcher persists one entry per correlation id.
#[tokio::test]
async fn test_outbox_dispatch_survives_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    let job_id = {
        let store = open_store(&dir)?;
        seed(&store)?;
        let engine = CaptureEngine::new(
            store.clone(),
            Arc::new(OutboxDispatcher::new(store.clone())),
            EngineConfig::default(),
        );
        let outcome = engine
            .submit(SubmitRequest::new(JobType::RecentSync, "repo-plain"))
            .await?;
        assert!(matches!(outcome, SubmitOutcome::Dispatched { .. }));
        outcome.job_id().to_string()
    };

    let store = open_store(&dir)?;
    let pending = store.pending_outbox(10)?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id, job_id);
    assert_eq!(pending[0].payload["job_id"], job_id);
    assert!(store.require_job(&job_id)?.metadata.workflow.is_some());
    Ok(())
}
