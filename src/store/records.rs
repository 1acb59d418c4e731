//! Record types for CaptureStore persistence.
//!
//! `CaptureJob` is the unit of capture work; `BackfillState` tracks a
//! repository's chunked historical sync; `RepositoryRecord` carries the
//! sizing and placement facts the router consumes.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CaptureError;
use crate::id::{generate_backfill_id, generate_job_id, now_ms, retry_job_id};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Get the string representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CaptureError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CaptureError::InvalidState(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Kind of capture work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    RecentSync,
    PrDetails,
    Reviews,
    Comments,
    CommitAnalysis,
    BackfillChunk,
}

string_enum!(JobType {
    RecentSync => "recent-sync",
    PrDetails => "pr-details",
    Reviews => "reviews",
    Comments => "comments",
    CommitAnalysis => "commit-analysis",
    BackfillChunk => "backfill-chunk",
});

/// Capture job lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up by a processor
    Pending,
    /// A processor is working on it
    Processing,
    Completed,
    /// Failed; may still be retried
    Failed,
    /// Permanently failed, never retried
    DeadLetter,
}

string_enum!(JobStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    DeadLetter => "dead_letter",
});

impl JobStatus {
    /// Check if this status stamps `completed_at`.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::DeadLetter)
    }
}

/// Execution processor a job is routed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Processor {
    /// Small, fast, frequent jobs
    LowLatency,
    /// Large, slow jobs such as backfills
    Batch,
}

string_enum!(Processor {
    LowLatency => "low_latency",
    Batch => "batch",
});

/// Scheduling priority class of a job.
///
/// Ordering is `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

string_enum!(PriorityClass {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// Placement priority tier of a repository.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryPriority {
    High,
    #[default]
    Medium,
    Low,
}

string_enum!(RepositoryPriority {
    High => "high",
    Medium => "medium",
    Low => "low",
});

/// What produced a capture request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Cron,
    DataGap,
    Retry,
    Backfill,
}

string_enum!(TriggerSource {
    Manual => "manual",
    Cron => "cron",
    DataGap => "data_gap",
    Retry => "retry",
    Backfill => "backfill",
});

/// One resubmission of a failed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryHistoryEntry {
    pub attempt: u32,
    pub timestamp: i64,
    pub previous_error: Option<String>,
}

/// Retry bookkeeping embedded in job metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryInfo {
    pub last_retry_at: Option<i64>,
    pub history: Vec<RetryHistoryEntry>,
    /// Set on the original job once a replacement was submitted
    pub retried: bool,
    /// Matched permanent-failure pattern, if classified permanent
    pub permanent_failure: Option<String>,
    pub exhausted: bool,
}

/// Dispatch bookkeeping written when a job reaches the execution fabric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInfo {
    pub correlation_id: String,
    pub external_id: String,
    pub dispatched_at: i64,
}

/// Routing outcome recorded on the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingInfo {
    pub reason: String,
    pub confidence: f64,
}

/// Derived execution metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub duration_ms: Option<i64>,
    pub items_processed: u64,
    pub items_failed: u64,
    pub avg_item_ms: Option<f64>,
}

/// Typed job metadata with a free-form extension map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobMetadata {
    pub trigger_source: Option<TriggerSource>,
    /// Requested capture window, in days back from now
    pub time_range_days: Option<f64>,
    pub max_items: Option<u32>,
    /// Processor may skip this job while a backfill is running
    pub skippable: bool,
    /// Original job this one re-submits
    pub retry_of: Option<String>,
    pub retry: RetryInfo,
    pub workflow: Option<WorkflowInfo>,
    pub routing: Option<RoutingInfo>,
    pub metrics: Option<JobMetrics>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobMetadata {
    /// Merge a patch into this metadata. Fields absent from the patch are kept.
    pub fn merge(&mut self, patch: MetadataPatch) {
        if patch.time_range_days.is_some() {
            self.time_range_days = patch.time_range_days;
        }
        if patch.max_items.is_some() {
            self.max_items = patch.max_items;
        }
        if let Some(skippable) = patch.skippable {
            self.skippable = skippable;
        }
        if patch.workflow.is_some() {
            self.workflow = patch.workflow;
        }
        if patch.routing.is_some() {
            self.routing = patch.routing;
        }
        if patch.metrics.is_some() {
            self.metrics = patch.metrics;
        }
        self.extra.extend(patch.extra);
    }
}

/// Partial metadata update applied by the status reporter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub time_range_days: Option<f64>,
    pub max_items: Option<u32>,
    pub skippable: Option<bool>,
    pub workflow: Option<WorkflowInfo>,
    pub routing: Option<RoutingInfo>,
    pub metrics: Option<JobMetrics>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MetadataPatch {
    /// Patch carrying one extension key.
    pub fn extra(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut patch = Self::default();
        patch.extra.insert(key.into(), value);
        patch
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A unit of capture work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureJob {
    pub id: String,
    pub job_type: JobType,
    pub repository_id: String,
    /// Denormalized `owner/name`, re-resolved on retry when missing
    pub repository_name: Option<String>,
    pub status: JobStatus,
    pub processor: Option<Processor>,
    pub priority: PriorityClass,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Bumped on every write; used for compare-and-swap updates
    pub version: i64,
    pub metadata: JobMetadata,
}

impl CaptureJob {
    /// Create a new pending job.
    pub fn new(job_type: JobType, repository_id: impl Into<String>) -> Self {
        Self {
            id: generate_job_id(),
            job_type,
            repository_id: repository_id.into(),
            repository_name: None,
            status: JobStatus::Pending,
            processor: None,
            priority: PriorityClass::default(),
            retry_count: 0,
            last_error: None,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            version: 0,
            metadata: JobMetadata::default(),
        }
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_time_range(mut self, days: f64) -> Self {
        self.metadata.time_range_days = Some(days);
        self
    }

    pub fn with_max_items(mut self, max_items: u32) -> Self {
        self.metadata.max_items = Some(max_items);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSource) -> Self {
        self.metadata.trigger_source = Some(trigger);
        self
    }

    pub fn with_repository_name(mut self, name: impl Into<String>) -> Self {
        self.repository_name = Some(name.into());
        self
    }

    /// Build the replacement job for a retry of `original`.
    ///
    /// The replacement inherits the original's retry count plus one so a
    /// chain of retries stays within the configured bound. Its id is derived
    /// from the original and the attempt.
    pub fn retry_of(original: &CaptureJob) -> Self {
        let mut job = Self::new(original.job_type, original.repository_id.clone());
        job.id = retry_job_id(&original.id, original.retry_count + 1);
        job.repository_name = original.repository_name.clone();
        job.priority = original.priority;
        job.retry_count = original.retry_count + 1;
        job.metadata.trigger_source = Some(TriggerSource::Retry);
        job.metadata.time_range_days = original.metadata.time_range_days;
        job.metadata.max_items = original.metadata.max_items;
        job.metadata.extra = original.metadata.extra.clone();
        job.metadata.retry_of = Some(original.id.clone());
        job
    }

    /// Payload handed to the execution fabric.
    pub fn dispatch_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "job_id": self.id,
            "job_type": self.job_type.as_str(),
            "repository_id": self.repository_id,
            "repository_name": self.repository_name,
            "processor": self.processor.map(|p| p.as_str()),
            "priority": self.priority.as_str(),
            "time_range_days": self.metadata.time_range_days,
            "max_items": self.metadata.max_items,
            "skippable": self.metadata.skippable,
            "retry_of": self.metadata.retry_of,
        })
    }
}

/// Per-job progress counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Backfill state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackfillStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

string_enum!(BackfillStatus {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
});

impl BackfillStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed transitions: `active -> paused|completed|failed`, `paused -> active`.
    pub fn can_transition_to(&self, next: BackfillStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Paused)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Failed)
                | (Self::Paused, Self::Active)
        )
    }
}

/// Progress of one repository's historical capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackfillState {
    pub id: String,
    pub repository_id: String,
    pub status: BackfillStatus,
    pub total_items: u64,
    pub processed_items: u64,
    pub chunk_size: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl BackfillState {
    pub fn new(repository_id: impl Into<String>, total_items: u64, processed_items: u64, chunk_size: u32) -> Self {
        let now = now_ms();
        Self {
            id: generate_backfill_id(),
            repository_id: repository_id.into(),
            status: BackfillStatus::Active,
            total_items,
            processed_items,
            chunk_size,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fraction of the target already captured, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_items == 0 {
            return 1.0;
        }
        (self.processed_items as f64 / self.total_items as f64).min(1.0)
    }

    pub fn is_done(&self) -> bool {
        self.processed_items >= self.total_items
    }
}

/// Repository metadata and placement facts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryRecord {
    pub id: String,
    pub owner: String,
    pub name: String,
    /// Known number of capturable items (PRs); the sizing signal
    pub item_count: u64,
    pub stars: u64,
    pub tracked: bool,
    pub is_workspace_repo: bool,
    pub workspace_count: u32,
    pub priority: RepositoryPriority,
    pub last_captured_at: Option<i64>,
}

impl RepositoryRecord {
    pub fn new(id: impl Into<String>, owner: impl Into<String>, name: impl Into<String>, item_count: u64) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            name: name.into(),
            item_count,
            stars: 0,
            tracked: true,
            is_workspace_repo: false,
            workspace_count: 0,
            priority: RepositoryPriority::Medium,
            last_captured_at: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_strings() {
        assert_eq!(JobType::BackfillChunk.as_str(), "backfill-chunk");
        assert_eq!("commit-analysis".parse::<JobType>().unwrap(), JobType::CommitAnalysis);
        assert!("nope".parse::<JobType>().is_err());
        assert_eq!(serde_json::to_string(&JobType::RecentSync).unwrap(), "\"recent-sync\"");
    }

    #[test]
    fn test_job_status_strings() {
        assert_eq!(JobStatus::DeadLetter.as_str(), "dead_letter");
        assert_eq!("processing".parse::<JobStatus>().unwrap(), JobStatus::Processing);
        assert!(JobStatus::Failed.is_finished());
        assert!(!JobStatus::Processing.is_finished());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(PriorityClass::Low < PriorityClass::Medium);
        assert!(PriorityClass::Medium < PriorityClass::High);
        assert!(PriorityClass::High < PriorityClass::Critical);
    }

    #[test]
    fn test_new_job_defaults() {
        let job = CaptureJob::new(JobType::RecentSync, "repo-1");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, PriorityClass::Medium);
        assert_eq!(job.retry_count, 0);
        assert!(job.processor.is_none());
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_metadata_merge_keeps_existing_fields() {
        let mut meta = JobMetadata {
            time_range_days: Some(7.0),
            max_items: Some(100),
            ..Default::default()
        };
        meta.extra.insert("keep".into(), serde_json::json!(1));

        let mut patch = MetadataPatch::extra("added", serde_json::json!("x"));
        patch.max_items = Some(50);
        meta.merge(patch);

        assert_eq!(meta.time_range_days, Some(7.0));
        assert_eq!(meta.max_items, Some(50));
        assert_eq!(meta.extra["keep"], 1);
        assert_eq!(meta.extra["added"], "x");
    }

    #[test]
    fn test_metadata_tolerates_unknown_shape() {
        let meta: JobMetadata = serde_json::from_str(r#"{"time_range_days": 2.0}"#).unwrap();
        assert_eq!(meta.time_range_days, Some(2.0));
        assert!(meta.retry.history.is_empty());
    }

    #[test]
    fn test_retry_of_carries_parameters() {
        let original = CaptureJob::new(JobType::Reviews, "repo-9")
            .with_priority(PriorityClass::High)
            .with_time_range(3.0)
            .with_max_items(40);
        let mut failed = original.clone();
        failed.retry_count = 1;

        let retry = CaptureJob::retry_of(&failed);
        assert_eq!(retry.id, format!("{}-r2", failed.id));
        assert_eq!(retry.job_type, JobType::Reviews);
        assert_eq!(retry.priority, PriorityClass::High);
        assert_eq!(retry.retry_count, 2);
        assert_eq!(retry.metadata.retry_of.as_deref(), Some(failed.id.as_str()));
        assert_eq!(retry.metadata.trigger_source, Some(TriggerSource::Retry));
        assert_eq!(retry.metadata.time_range_days, Some(3.0));
        assert_eq!(retry.metadata.max_items, Some(40));
    }

    #[test]
    fn test_backfill_transitions() {
        assert!(BackfillStatus::Active.can_transition_to(BackfillStatus::Paused));
        assert!(BackfillStatus::Paused.can_transition_to(BackfillStatus::Active));
        assert!(BackfillStatus::Active.can_transition_to(BackfillStatus::Completed));
        assert!(!BackfillStatus::Paused.can_transition_to(BackfillStatus::Completed));
        assert!(!BackfillStatus::Completed.can_transition_to(BackfillStatus::Active));
        assert!(!BackfillStatus::Failed.can_transition_to(BackfillStatus::Active));
        assert!(BackfillStatus::Completed.is_terminal());
    }

    #[test]
    fn test_backfill_progress() {
        let mut state = BackfillState::new("repo-1", 200, 50, 25);
        assert_eq!(state.status, BackfillStatus::Active);
        assert!((state.progress() - 0.25).abs() < f64::EPSILON);
        assert!(!state.is_done());
        state.processed_items = 250;
        assert!(state.is_done());
        assert_eq!(state.progress(), 1.0);
    }

    #[test]
    fn test_repository_full_name() {
        let repo = RepositoryRecord::new("r1", "octo", "widgets", 10);
        assert_eq!(repo.full_name(), "octo/widgets");
        assert!(repo.tracked);
    }
}
