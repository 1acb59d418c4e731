//! Auto-retry service.
//!
//! Periodically scans recent `failed` jobs and decides, per job:
//!
//! 1. **Exhausted**: retry budget used up; flagged and reported, never resubmitted.
//! 2. **Permanent**: error matches a known permanent pattern; moved to `dead_letter`.
//! 3. **Not due**: backoff since the last attempt has not elapsed yet.
//! 4. **Invalid**: no repository reference; moved to `dead_letter`.
//! 5. Otherwise a new job with the original parameters is submitted.
//!
//! A failure while handling one job is recorded and the scan moves on.

mod policy;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch::{JobSubmitter, RepositoryProvider};
use crate::error::Result;
use crate::id::{now_ms, retry_job_id};
use crate::store::{CaptureJob, CaptureStore, RetryHistoryEntry};

pub use policy::{FailureClass, PERMANENT_FAILURE_PATTERNS, RetryConfig, backoff_delay, classify, jitter_sample};

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryScanReport {
    pub scanned: usize,
    /// `(original_job_id, replacement_job_id)`
    pub retried: Vec<(String, String)>,
    pub permanent: Vec<String>,
    pub exhausted: Vec<String>,
    pub not_due: usize,
    /// Already resubmitted, or claimed by a concurrent scan
    pub skipped: usize,
    /// `(job_id, error)` for jobs whose handling failed
    pub errors: Vec<(String, String)>,
}

/// Retry counters over the stats window.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStats {
    pub total_retries: u64,
    /// Replacement jobs that reached `completed`
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub average_retry_count: f64,
    pub permanent_failures: u64,
    pub window: Duration,
}

enum JobOutcome {
    Retried(String),
    Permanent,
    Exhausted,
    NotDue,
    Skipped,
}

pub struct RetryService {
    config: RetryConfig,
    store: Arc<CaptureStore>,
    repositories: Arc<dyn RepositoryProvider>,
    submitter: Arc<dyn JobSubmitter>,
}

impl RetryService {
    pub fn new(
        config: RetryConfig,
        store: Arc<CaptureStore>,
        repositories: Arc<dyn RepositoryProvider>,
        submitter: Arc<dyn JobSubmitter>,
    ) -> Self {
        Self {
            config,
            store,
            repositories,
            submitter,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Scan failed jobs once.
    pub async fn scan(&self) -> RetryScanReport {
        self.scan_at(now_ms()).await
    }

    /// Scan as of `now` (ms since epoch).
    pub async fn scan_at(&self, now: i64) -> RetryScanReport {
        let mut report = RetryScanReport::default();
        let since = now - self.config.lookback.as_millis() as i64;

        let failed = match self.store.list_failed_since(since) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Retry scan could not list failed jobs");
                report.errors.push(("*".to_string(), e.to_string()));
                return report;
            }
        };

        for job in failed {
            report.scanned += 1;
            match self.process(&job, now).await {
                Ok(JobOutcome::Retried(new_id)) => report.retried.push((job.id.clone(), new_id)),
                Ok(JobOutcome::Permanent) => report.permanent.push(job.id.clone()),
                Ok(JobOutcome::Exhausted) => report.exhausted.push(job.id.clone()),
                Ok(JobOutcome::NotDue) => report.not_due += 1,
                Ok(JobOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Retry handling failed");
                    report.errors.push((job.id.clone(), e.to_string()));
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                retried = report.retried.len(),
                permanent = report.permanent.len(),
                exhausted = report.exhausted.len(),
                not_due = report.not_due,
                errors = report.errors.len(),
                "Retry scan finished"
            );
        }
        report
    }

    async fn process(&self, job: &CaptureJob, now: i64) -> Result<JobOutcome> {
        if job.metadata.retry.retried {
            return Ok(JobOutcome::Skipped);
        }

        // A replacement persisted by an earlier scan whose submit reported an error
        if job.retry_count > 0
            && let Some(existing) = self.store.get_job(&retry_job_id(&job.id, job.retry_count))?
            && existing.metadata.retry_of.as_deref() == Some(job.id.as_str())
        {
            self.store.mark_retried(&job.id, &existing.id)?;
            tracing::info!(job_id = %job.id, replacement = %existing.id, "Linked previously submitted replacement");
            return Ok(JobOutcome::Retried(existing.id));
        }

        if job.retry_count >= self.config.max_retries {
            if !job.metadata.retry.exhausted && self.store.mark_exhausted(&job.id)? {
                tracing::warn!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    last_error = job.last_error.as_deref().unwrap_or(""),
                    "Retries exhausted"
                );
            }
            return Ok(JobOutcome::Exhausted);
        }

        if let FailureClass::Permanent(pattern) = classify(job.last_error.as_deref()) {
            self.store.mark_dead_letter(&job.id, pattern)?;
            tracing::info!(job_id = %job.id, pattern, "Permanent failure, moved to dead letter");
            return Ok(JobOutcome::Permanent);
        }

        if !self.is_due(job, now) {
            return Ok(JobOutcome::NotDue);
        }

        if job.repository_id.trim().is_empty() {
            self.store.mark_dead_letter(&job.id, "missing repository reference")?;
            tracing::info!(job_id = %job.id, "Job has no repository, moved to dead letter");
            return Ok(JobOutcome::Permanent);
        }

        let entry = RetryHistoryEntry {
            attempt: job.retry_count + 1,
            timestamp: now,
            previous_error: job.last_error.clone(),
        };
        if !self
            .store
            .record_retry(&job.id, job.retry_count, self.config.max_retries, entry)?
        {
            return Ok(JobOutcome::Skipped);
        }

        let mut replacement = CaptureJob::retry_of(job);
        if replacement.repository_name.is_none()
            && let Some(repo) = self.repositories.get_repository(&job.repository_id).await?
        {
            replacement.repository_name = Some(repo.full_name());
        }

        let new_id = self.submitter.submit_job(replacement).await?;
        self.store.mark_retried(&job.id, &new_id)?;
        tracing::info!(
            job_id = %job.id,
            replacement = %new_id,
            attempt = job.retry_count + 1,
            "Resubmitted failed job"
        );
        Ok(JobOutcome::Retried(new_id))
    }

    /// Whether the backoff for the job's next attempt has elapsed.
    ///
    /// Measured from the last retry, or from when the job failed if it was
    /// never retried.
    pub fn is_due(&self, job: &CaptureJob, now: i64) -> bool {
        let since = job
            .metadata
            .retry
            .last_retry_at
            .or(job.completed_at)
            .unwrap_or(job.created_at);
        let required = backoff_delay(&self.config, job.retry_count, jitter_sample(&job.id, job.retry_count));
        now - since >= required.as_millis() as i64
    }

    /// Retry statistics over the configured window.
    pub fn stats(&self) -> Result<RetryStats> {
        self.stats_over(self.config.stats_window)
    }

    pub fn stats_over(&self, window: Duration) -> Result<RetryStats> {
        let counts = self.store.retry_window_counts(now_ms() - window.as_millis() as i64)?;
        Ok(RetryStats {
            total_retries: counts.total_retries,
            successful_retries: counts.successful_retries,
            failed_retries: counts.total_retries.saturating_sub(counts.successful_retries),
            average_retry_count: counts.average_retry_count,
            permanent_failures: counts.permanent_failures,
            window,
        })
    }

    /// Scan immediately, then every `interval`, until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.config.interval.as_secs(), "Retry service started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Retry service stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
