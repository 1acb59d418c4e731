//! Capture engine.
//!
//! The long-lived service tying the components together: a request is
//! persisted, prioritized from its repository's placement, routed, and
//! admitted by the limiter of the chosen processor. Finished jobs release
//! their slot, advance any backfill they belong to, and feed the upstream
//! backoff.
//!
//! # Example
//!
//! ```ignore
//! let engine = CaptureEngine::new(store, dispatcher, EngineConfig::default());
//! let outcome = engine.submit(SubmitRequest::new(JobType::RecentSync, "repo-1")).await?;
//! // ... the processor runs the job ...
//! engine.finish(outcome.job_id(), FinishOutcome::completed(42, 0), elapsed).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::backfill::{BackfillConfig, BackfillTracker, InitiationOutcome, backfill_id_of};
use crate::dispatch::{JobSubmitter, LogNotifier, NotificationSink, RepositoryProvider, TaskDispatcher};
use crate::error::{CaptureError, Result};
use crate::id::now_ms;
use crate::reporter::{StatusReporter, StatusUpdate};
use crate::routing::{Router, RoutingConfig, RoutingDecision, RoutingProfile, priority_for_score};
use crate::scheduler::{
    AcquireOutcome, AdmissionRequest, ConcurrencyLimiter, ConcurrencyTier, DispatchOutcome, HealthReport,
    UpstreamBackoff, is_rate_limit_error,
};
use crate::store::{
    BackfillStatus, CaptureJob, CaptureStore, JobProgress, JobStatus, JobType, PriorityClass, Processor, TriggerSource,
};

/// Component settings the engine is built from.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub routing: RoutingConfig,
    pub tier: ConcurrencyTier,
    pub backfill: BackfillConfig,
}

/// A request for capture work.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub job_type: JobType,
    pub repository_id: String,
    pub time_range_days: Option<f64>,
    pub max_items: Option<u32>,
    /// Derived from repository placement when absent
    pub priority: Option<PriorityClass>,
    pub trigger: TriggerSource,
}

impl SubmitRequest {
    pub fn new(job_type: JobType, repository_id: impl Into<String>) -> Self {
        Self {
            job_type,
            repository_id: repository_id.into(),
            time_range_days: None,
            max_items: None,
            priority: None,
            trigger: TriggerSource::Manual,
        }
    }

    pub fn with_time_range(mut self, days: f64) -> Self {
        self.time_range_days = Some(days);
        self
    }

    pub fn with_max_items(mut self, max_items: u32) -> Self {
        self.max_items = Some(max_items);
        self
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSource) -> Self {
        self.trigger = trigger;
        self
    }

    fn into_job(self) -> CaptureJob {
        let mut job = CaptureJob::new(self.job_type, self.repository_id).with_trigger(self.trigger);
        if let Some(days) = self.time_range_days {
            job = job.with_time_range(days);
        }
        if let Some(max_items) = self.max_items {
            job = job.with_max_items(max_items);
        }
        if let Some(priority) = self.priority {
            job = job.with_priority(priority);
        }
        job
    }
}

/// What happened to a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Dispatched {
        job_id: String,
        processor: Processor,
        external_id: String,
    },
    Queued {
        job_id: String,
        processor: Processor,
        position: usize,
        estimated_wait: Duration,
    },
    /// Queue full; the job is marked failed with a throttle error
    Rejected { job_id: String, processor: Processor },
    /// Every dispatch attempt failed; the job is marked failed
    DispatchFailed { job_id: String, error: String },
}

impl SubmitOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            SubmitOutcome::Dispatched { job_id, .. }
            | SubmitOutcome::Queued { job_id, .. }
            | SubmitOutcome::Rejected { job_id, .. }
            | SubmitOutcome::DispatchFailed { job_id, .. } => job_id,
        }
    }
}

/// How a job's execution ended, as reported by its processor.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    Completed { items_processed: u64, items_failed: u64 },
    Failed {
        error: String,
        /// Upstream reset hint, for rate-limit failures
        retry_after: Option<Duration>,
    },
}

impl FinishOutcome {
    pub fn completed(items_processed: u64, items_failed: u64) -> Self {
        FinishOutcome::Completed {
            items_processed,
            items_failed,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        FinishOutcome::Failed {
            error: error.into(),
            retry_after: None,
        }
    }
}

/// Result of `initiate_backfill`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillStart {
    pub outcome: InitiationOutcome,
    /// Submission of the first chunk, when a backfill was started
    pub first_chunk: Option<SubmitOutcome>,
}

pub struct CaptureEngine {
    store: Arc<CaptureStore>,
    router: Router,
    low_latency: ConcurrencyLimiter,
    batch: ConcurrencyLimiter,
    reporter: StatusReporter,
    backfill: BackfillTracker,
    notifier: Arc<dyn NotificationSink>,
    upstream: Mutex<UpstreamBackoff>,
    /// Dispatched jobs holding a limiter slot
    in_flight: Mutex<HashMap<String, Processor>>,
}

impl CaptureEngine {
    /// Build an engine that reads repository metadata from the store and
    /// notifies through the log.
    pub fn new(store: Arc<CaptureStore>, dispatcher: Arc<dyn TaskDispatcher>, config: EngineConfig) -> Self {
        let repositories: Arc<dyn RepositoryProvider> = store.clone();
        Self {
            router: Router::new(config.routing, store.clone(), repositories),
            low_latency: ConcurrencyLimiter::new(Processor::LowLatency, config.tier.clone(), dispatcher.clone()),
            batch: ConcurrencyLimiter::new(Processor::Batch, config.tier, dispatcher),
            reporter: StatusReporter::new(store.clone()),
            backfill: BackfillTracker::new(config.backfill, store.clone()),
            notifier: Arc::new(LogNotifier),
            upstream: Mutex::new(UpstreamBackoff::new()),
            in_flight: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_repositories(mut self, repositories: Arc<dyn RepositoryProvider>) -> Self {
        self.router = Router::new(self.router.config().clone(), self.store.clone(), repositories);
        self
    }

    pub fn with_redispatch_delay(mut self, delay: Duration) -> Self {
        self.low_latency = self.low_latency.with_redispatch_delay(delay);
        self.batch = self.batch.with_redispatch_delay(delay);
        self
    }

    pub fn store(&self) -> &Arc<CaptureStore> {
        &self.store
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    pub fn backfill(&self) -> &BackfillTracker {
        &self.backfill
    }

    pub fn limiter(&self, processor: Processor) -> &ConcurrencyLimiter {
        match processor {
            Processor::LowLatency => &self.low_latency,
            Processor::Batch => &self.batch,
        }
    }

    /// Persist, route and admit a new capture request.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        let explicit_priority = request.priority.is_some();
        self.schedule(request.into_job(), explicit_priority).await
    }

    /// Mark a dispatched job as running.
    pub async fn start(&self, job_id: &str) -> Result<CaptureJob> {
        self.reporter
            .report_status(StatusUpdate::new(job_id, JobStatus::Processing))
            .await
    }

    /// Record the end of a job's execution.
    ///
    /// Releases the job's limiter slot, hands the slot to the next waiting
    /// request unless upstream is rate-limited, and advances the backfill a
    /// chunk job belongs to. The slot is released even when recording the
    /// status fails; the reporting error is returned afterwards.
    pub async fn finish(&self, job_id: &str, outcome: FinishOutcome, execution_time: Duration) -> Result<CaptureJob> {
        match &outcome {
            FinishOutcome::Completed { .. } => self.upstream.lock().await.record_success(),
            FinishOutcome::Failed { error, retry_after } => {
                if is_rate_limit_error(error) {
                    self.upstream.lock().await.record_rate_limit(*retry_after);
                }
            }
        }
        self.release_slot(job_id, execution_time).await;

        let job = self.store.require_job(job_id)?;
        // Repeated reports of a finished job change its status only
        let first_finish = !job.status.is_finished();

        let reported = match &outcome {
            FinishOutcome::Completed {
                items_processed,
                items_failed,
            } => {
                let progress = JobProgress {
                    total: items_processed + items_failed,
                    processed: *items_processed,
                    failed: *items_failed,
                };
                let _ = self.reporter.update_progress(job_id, progress).await;
                if let Err(e) = self.store.touch_captured(&job.repository_id, now_ms()) {
                    tracing::warn!(repository_id = %job.repository_id, error = %e, "Failed to stamp capture time");
                }
                self.reporter
                    .report_status(StatusUpdate::new(job_id, JobStatus::Completed))
                    .await
            }
            FinishOutcome::Failed { error, .. } => {
                self.reporter
                    .report_status(StatusUpdate::new(job_id, JobStatus::Failed).with_error(error.clone()))
                    .await
            }
        };
        let _ = self.reporter.calculate_metrics(job_id).await;

        if first_finish && let FinishOutcome::Completed { items_processed, .. } = outcome {
            self.advance_backfill(&job, items_processed).await?;
        }

        reported
    }

    /// Give back the slot a dispatched job holds, once, and offer it to the
    /// next waiting request.
    async fn release_slot(&self, job_id: &str, execution_time: Duration) {
        let Some(processor) = self.in_flight.lock().await.remove(job_id) else {
            debug!("Job {} holds no limiter slot", job_id);
            return;
        };
        let limiter = self.limiter(processor);
        limiter.free_slot(execution_time).await;
        let held = self.upstream.lock().await.is_backing_off();
        if !held && let Some(next) = limiter.dispatch_next().await {
            self.handle_dispatch(processor, next).await;
        }
    }

    /// Start a backfill for a repository and submit its first chunk.
    pub async fn initiate_backfill(&self, repository_id: &str, captured: u64) -> Result<BackfillStart> {
        let repo = self
            .store
            .get_repository(repository_id)?
            .ok_or_else(|| CaptureError::RepositoryNotFound(repository_id.to_string()))?;

        let outcome = self.backfill.initiate(&repo, captured)?;
        let first_chunk = match &outcome {
            InitiationOutcome::Initiated(state) => Some(self.schedule(self.backfill.chunk_job(state), true).await?),
            InitiationOutcome::AlreadyActive(state) => {
                debug!("Backfill {} already active for {}", state.id, repository_id);
                None
            }
            InitiationOutcome::NotEligible(reason) => {
                debug!("{} not eligible for backfill: {:?}", repository_id, reason);
                None
            }
        };

        Ok(BackfillStart { outcome, first_chunk })
    }

    /// Dispatch whatever the limiters admit now. Returns the number dispatched.
    ///
    /// Cooldowns expire without a release, so waiting requests are only
    /// picked up by a periodic drain.
    pub async fn drain_queues(&self) -> usize {
        if let Some(remaining) = self.upstream.lock().await.remaining() {
            debug!("Upstream backoff active for {:?}, not draining", remaining);
            return 0;
        }

        let mut dispatched = 0;
        for limiter in [&self.low_latency, &self.batch] {
            for outcome in limiter.drain().await {
                if self.handle_dispatch(limiter.processor(), outcome).await {
                    dispatched += 1;
                }
            }
        }
        dispatched
    }

    /// Health of both limiters, low-latency first.
    pub async fn health(&self) -> Vec<HealthReport> {
        vec![self.low_latency.health().await, self.batch.health().await]
    }

    pub async fn upstream_backoff_remaining(&self) -> Option<Duration> {
        self.upstream.lock().await.remaining()
    }

    async fn schedule(&self, mut job: CaptureJob, explicit_priority: bool) -> Result<SubmitOutcome> {
        let lookup = if job.job_type == JobType::BackfillChunk {
            Ok(None)
        } else {
            self.router.profile(&job.repository_id).await
        };

        if let Ok(Some(profile)) = &lookup {
            if job.repository_name.is_none() {
                job.repository_name = Some(profile.repository.full_name());
            }
            if !explicit_priority {
                job.priority = priority_for_score(profile.priority_score);
            }
        }
        self.store.insert_job(&job)?;

        let decision = self.decide(&job, &lookup);
        let job = self
            .store
            .set_processor(&job.id, decision.processor, decision.metadata_patch())?;
        info!(
            "Job {} ({}) for {} routed to {}: {}",
            job.id, job.job_type, job.repository_id, decision.processor, decision.reason
        );

        self.admit(job).await
    }

    fn decide(&self, job: &CaptureJob, lookup: &Result<Option<RoutingProfile>>) -> RoutingDecision {
        match lookup {
            Ok(profile) => self.router.route_with_profile(job, profile.as_ref()),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Routing lookup failed, using fallback");
                RoutingDecision::fallback()
            }
        }
    }

    async fn admit(&self, job: CaptureJob) -> Result<SubmitOutcome> {
        let processor = job.processor.unwrap_or(Processor::LowLatency);
        let limiter = self.limiter(processor);
        let request = AdmissionRequest::for_job(&job);

        let held = self.upstream.lock().await.is_backing_off();
        let admission = if held {
            limiter.enqueue(request.clone()).await
        } else {
            limiter.acquire(request.clone()).await
        };

        match admission {
            AcquireOutcome::Acquired => match limiter.dispatch(request).await {
                DispatchOutcome::Dispatched {
                    job_id,
                    correlation_id,
                    external_id,
                } => {
                    self.record_in_flight(processor, &job_id, &correlation_id, &external_id)
                        .await;
                    Ok(SubmitOutcome::Dispatched {
                        job_id,
                        processor,
                        external_id,
                    })
                }
                DispatchOutcome::Abandoned { job_id, error } => {
                    self.fail_undispatched(&job_id, &error).await?;
                    Ok(SubmitOutcome::DispatchFailed { job_id, error })
                }
            },
            AcquireOutcome::Queued {
                position,
                estimated_wait,
            } => {
                self.notifier.show_jobs_queued(1, processor.as_str()).await;
                Ok(SubmitOutcome::Queued {
                    job_id: job.id,
                    processor,
                    position,
                    estimated_wait,
                })
            }
            AcquireOutcome::Rejected => {
                let error = format!("throttled: {} queue is full", processor);
                self.reporter
                    .report_status(StatusUpdate::new(&job.id, JobStatus::Failed).with_error(error.clone()))
                    .await?;
                self.notifier
                    .show_warning(&format!("Job {} rejected: {}", job.id, error))
                    .await;
                Ok(SubmitOutcome::Rejected {
                    job_id: job.id,
                    processor,
                })
            }
        }
    }

    /// Record the result of a queued request's dispatch. Returns whether it went out.
    async fn handle_dispatch(&self, processor: Processor, outcome: DispatchOutcome) -> bool {
        match outcome {
            DispatchOutcome::Dispatched {
                job_id,
                correlation_id,
                external_id,
            } => {
                self.record_in_flight(processor, &job_id, &correlation_id, &external_id)
                    .await;
                true
            }
            DispatchOutcome::Abandoned { job_id, error } => {
                if let Err(e) = self.fail_undispatched(&job_id, &error).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record abandoned dispatch");
                }
                false
            }
        }
    }

    /// The slot is tracked before the dispatch is reported, so a failed
    /// metadata write cannot strand it.
    async fn record_in_flight(&self, processor: Processor, job_id: &str, correlation_id: &str, external_id: &str) {
        self.in_flight.lock().await.insert(job_id.to_string(), processor);
        let _ = self
            .reporter
            .record_dispatch(job_id, correlation_id, external_id)
            .await;
    }

    async fn fail_undispatched(&self, job_id: &str, error: &str) -> Result<()> {
        self.reporter
            .report_status(StatusUpdate::new(job_id, JobStatus::Failed).with_error(format!("dispatch failed: {}", error)))
            .await?;
        self.notifier
            .show_warning(&format!("Job {} could not be dispatched: {}", job_id, error))
            .await;
        Ok(())
    }

    async fn advance_backfill(&self, job: &CaptureJob, items: u64) -> Result<()> {
        if job.job_type != JobType::BackfillChunk {
            return Ok(());
        }
        let Some(backfill_id) = backfill_id_of(job) else {
            tracing::warn!(job_id = %job.id, "Backfill chunk without a backfill id");
            return Ok(());
        };

        let state = self.backfill.record_chunk(backfill_id, items)?;
        if state.status == BackfillStatus::Active {
            let next = self.schedule(self.backfill.chunk_job(&state), true).await?;
            debug!("Backfill {} next chunk: {}", state.id, next.job_id());
        } else {
            info!("Backfill {} finished as {}", state.id, state.status);
        }
        Ok(())
    }
}

#[async_trait]
impl JobSubmitter for CaptureEngine {
    async fn submit_job(&self, job: CaptureJob) -> Result<String> {
        let outcome = self.schedule(job, true).await?;
        Ok(outcome.job_id().to_string())
    }
}
