//! Storage layer for hubcapture.
//!
//! A single SQLite database is the source of truth shared by every
//! component. Writes are narrowly scoped (status columns, a metadata merge,
//! a retry-count compare-and-swap) so concurrently running components do not
//! overwrite each other's fields.
//!
//! # Example
//!
//! ```ignore
//! use hubcapture::store::{CaptureStore, CaptureJob, JobType, JobStatus};
//!
//! let store = CaptureStore::open(Path::new("/var/lib/hubcapture/capture.db"))?;
//! let job = CaptureJob::new(JobType::RecentSync, "repo-1").with_time_range(1.0);
//! store.insert_job(&job)?;
//!
//! let failed = store.list_jobs(&JobFilter::default().with_status(JobStatus::Failed))?;
//! ```

mod capture_store;
mod records;

pub use capture_store::{CaptureStore, JobFilter, OutboxEntry, RetryWindowCounts};
pub use records::{
    BackfillState, BackfillStatus, CaptureJob, JobMetadata, JobMetrics, JobProgress, JobStatus, JobType,
    MetadataPatch, PriorityClass, Processor, RepositoryPriority, RepositoryRecord, RetryHistoryEntry, RetryInfo,
    RoutingInfo, TriggerSource, WorkflowInfo,
};
