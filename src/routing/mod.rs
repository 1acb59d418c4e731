//! Routing decision engine.
//!
//! Picks the execution processor for a capture job. Hard overrides are
//! checked first, in order:
//!
//! 1. `backfill-chunk` jobs always go to the batch processor.
//! 2. Unknown repositories go to the low-latency processor.
//! 3. While the repository has an active backfill, recent requests stay on
//!    the low-latency processor and everything else is sent to batch and
//!    marked skippable.
//!
//! Otherwise five weighted factors produce a low-latency score, both scores
//! are damped by processor load, and the larger damped score wins. A fixed
//! share of traffic is drawn for the batch processor before the scores are
//! compared.
//!
//! Routing never blocks submission: lookup failures fall back to the
//! low-latency processor.

mod factors;
mod profile;

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dispatch::RepositoryProvider;
use crate::error::Result;
use crate::id::now_ms;
use crate::store::{CaptureJob, CaptureStore, JobType, MetadataPatch, Processor, RoutingInfo};

pub use factors::{FactorWeights, Factors};
pub use profile::{RoutingProfile, placement_score, priority_for_score};

/// Router tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Repositories above this many items count as large
    pub large_repo_threshold: u64,
    /// Ranges beyond this many days count as historical
    pub historical_days: f64,
    /// Ranges up to this many days count as recent; also the clamp applied
    /// to recent-sync jobs during a backfill
    pub recent_window_days: f64,
    /// Share of traffic drawn for the batch processor
    pub random_batch_fraction: f64,
    /// Assumed processing capacity per processor, for load
    pub processor_capacity: usize,
    /// Range assumed when a job does not carry one
    pub default_time_range_days: f64,
    pub weights: FactorWeights,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            large_repo_threshold: 1000,
            historical_days: 7.0,
            recent_window_days: 1.0,
            random_batch_fraction: 0.25,
            processor_capacity: 100,
            default_time_range_days: 1.0,
            weights: FactorWeights::default(),
        }
    }
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingReason {
    BackfillChunk,
    RepositoryNotFound,
    RecentDataDuringBackfill,
    ActiveBackfillInProgress,
    LargeRepoHistoricalData,
    RecentDataRealTime,
    RandomDistribution,
    ScoreBased,
    ErrorFallback,
}

impl RoutingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingReason::BackfillChunk => "backfill_chunk",
            RoutingReason::RepositoryNotFound => "repository_not_found",
            RoutingReason::RecentDataDuringBackfill => "recent_data_during_backfill",
            RoutingReason::ActiveBackfillInProgress => "active_backfill_in_progress",
            RoutingReason::LargeRepoHistoricalData => "large_repo_historical_data",
            RoutingReason::RecentDataRealTime => "recent_data_real_time",
            RoutingReason::RandomDistribution => "random_distribution_25_percent",
            RoutingReason::ScoreBased => "score_based_routing",
            RoutingReason::ErrorFallback => "routing_error_fallback",
        }
    }
}

impl std::fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of routing one job.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub processor: Processor,
    pub reason: RoutingReason,
    pub confidence: f64,
    /// Processor may skip the job while a backfill runs
    pub skippable: bool,
    /// Set when the router narrowed the job's time range
    pub clamped_time_range_days: Option<f64>,
}

impl RoutingDecision {
    fn new(processor: Processor, reason: RoutingReason, confidence: f64) -> Self {
        Self {
            processor,
            reason,
            confidence,
            skippable: false,
            clamped_time_range_days: None,
        }
    }

    /// The fail-open decision.
    pub fn fallback() -> Self {
        Self::new(Processor::LowLatency, RoutingReason::ErrorFallback, 0.3)
    }

    /// Metadata written to the job alongside the processor.
    pub fn metadata_patch(&self) -> MetadataPatch {
        MetadataPatch {
            time_range_days: self.clamped_time_range_days,
            skippable: self.skippable.then_some(true),
            routing: Some(RoutingInfo {
                reason: self.reason.as_str().to_string(),
                confidence: self.confidence,
            }),
            ..Default::default()
        }
    }
}

/// Confidence reported by the backfill overrides.
const BACKFILL_OVERRIDE_CONFIDENCE: f64 = 0.8;

/// Decide a processor for `job`.
///
/// `profile` is `None` when the repository is unknown. `draw` is a uniform
/// sample in `[0, 1)` for the random batch share.
pub fn decide(config: &RoutingConfig, job: &CaptureJob, profile: Option<&RoutingProfile>, draw: f64) -> RoutingDecision {
    if job.job_type == JobType::BackfillChunk {
        return RoutingDecision::new(Processor::Batch, RoutingReason::BackfillChunk, 1.0);
    }

    let Some(profile) = profile else {
        return RoutingDecision::new(Processor::LowLatency, RoutingReason::RepositoryNotFound, 0.5);
    };

    let range = job
        .metadata
        .time_range_days
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(config.default_time_range_days);

    if profile.active_backfill.is_some() {
        if job.job_type == JobType::RecentSync {
            let mut decision = RoutingDecision::new(
                Processor::LowLatency,
                RoutingReason::RecentDataDuringBackfill,
                BACKFILL_OVERRIDE_CONFIDENCE,
            );
            if range > config.recent_window_days {
                decision.clamped_time_range_days = Some(config.recent_window_days);
            }
            return decision;
        }
        if range <= config.recent_window_days {
            return RoutingDecision::new(
                Processor::LowLatency,
                RoutingReason::RecentDataDuringBackfill,
                BACKFILL_OVERRIDE_CONFIDENCE,
            );
        }
        let mut decision = RoutingDecision::new(
            Processor::Batch,
            RoutingReason::ActiveBackfillInProgress,
            BACKFILL_OVERRIDE_CONFIDENCE,
        );
        decision.skippable = true;
        return decision;
    }

    let factors = Factors {
        time_sensitivity: factors::time_sensitivity(range),
        batch_size: factors::batch_size(job.metadata.max_items),
        repo_size: factors::repo_size(profile.repository.item_count, config.large_repo_threshold),
        data_age: factors::data_age(range, config.historical_days),
        priority: factors::priority(job.priority),
    };
    let low_latency = factors.low_latency_score(&config.weights);
    let batch = 1.0 - low_latency;

    let low_latency = low_latency * (1.0 - profile.low_latency_load.clamp(0.0, 1.0));
    let batch = batch * (1.0 - profile.batch_load.clamp(0.0, 1.0));
    let confidence = (low_latency - batch).abs();

    if !low_latency.is_finite() || !batch.is_finite() {
        return RoutingDecision::fallback();
    }

    // The random share is decided first; it only yields when the damped
    // low-latency score is still higher.
    let random_fired = draw < config.random_batch_fraction;
    if random_fired && batch >= low_latency {
        return RoutingDecision::new(Processor::Batch, RoutingReason::RandomDistribution, confidence);
    }

    if batch > low_latency {
        let large = profile.repository.item_count > config.large_repo_threshold;
        let reason = if large && range > config.historical_days {
            RoutingReason::LargeRepoHistoricalData
        } else {
            RoutingReason::ScoreBased
        };
        RoutingDecision::new(Processor::Batch, reason, confidence)
    } else {
        let reason = if range <= config.recent_window_days {
            RoutingReason::RecentDataRealTime
        } else {
            RoutingReason::ScoreBased
        };
        RoutingDecision::new(Processor::LowLatency, reason, confidence)
    }
}

/// Routes jobs using repository metadata and live processor load.
pub struct Router {
    config: RoutingConfig,
    store: Arc<CaptureStore>,
    repositories: Arc<dyn RepositoryProvider>,
}

impl Router {
    pub fn new(config: RoutingConfig, store: Arc<CaptureStore>, repositories: Arc<dyn RepositoryProvider>) -> Self {
        Self {
            config,
            store,
            repositories,
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Assemble the routing profile for a repository. `None` if unknown.
    pub async fn profile(&self, repository_id: &str) -> Result<Option<RoutingProfile>> {
        let Some(repository) = self.repositories.get_repository(repository_id).await? else {
            return Ok(None);
        };

        let active_backfill = self.store.active_backfill(&repository.id)?;
        let capacity = self.config.processor_capacity.max(1) as f64;
        let low_latency_load = (self.store.count_processing(Processor::LowLatency)? as f64 / capacity).min(1.0);
        let batch_load = (self.store.count_processing(Processor::Batch)? as f64 / capacity).min(1.0);
        let priority_score = placement_score(&repository, now_ms());

        Ok(Some(RoutingProfile {
            repository,
            active_backfill,
            low_latency_load,
            batch_load,
            priority_score,
        }))
    }

    /// Route a job, looking up its repository profile.
    pub async fn route(&self, job: &CaptureJob) -> RoutingDecision {
        if job.job_type == JobType::BackfillChunk {
            return decide(&self.config, job, None, 1.0);
        }

        match self.profile(&job.repository_id).await {
            Ok(profile) => self.route_with_profile(job, profile.as_ref()),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Routing lookup failed, using fallback");
                RoutingDecision::fallback()
            }
        }
    }

    /// Route a job against an already-built profile.
    pub fn route_with_profile(&self, job: &CaptureJob, profile: Option<&RoutingProfile>) -> RoutingDecision {
        let draw: f64 = rand::rng().random();
        let decision = decide(&self.config, job, profile, draw);
        tracing::debug!(
            job_id = %job.id,
            processor = %decision.processor,
            reason = %decision.reason,
            confidence = decision.confidence,
            "Routed job"
        );
        decision
    }
}
