//! CaptureStore implementation on SQLite.
//!
//! One connection behind a mutex; every multi-step update runs inside a
//! transaction while the lock is held. Enum columns are stored as their
//! string form, metadata as JSON text.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{CaptureError, Result};
use crate::id::now_ms;
use crate::store::records::{
    BackfillState, BackfillStatus, CaptureJob, JobMetadata, JobProgress, JobStatus, MetadataPatch, Processor,
    RepositoryPriority, RepositoryRecord, RetryHistoryEntry,
};

/// Current schema version. Increment when adding a migration.
const CURRENT_SCHEMA_VERSION: i64 = 2;

const JOB_COLUMNS: &str = "id, job_type, repository_id, repository_name, status, processor, priority, \
     retry_count, last_error, created_at, started_at, completed_at, version, metadata";

const BACKFILL_COLUMNS: &str =
    "id, repository_id, status, total_items, processed_items, chunk_size, metadata, created_at, updated_at";

const REPOSITORY_COLUMNS: &str =
    "id, owner, name, item_count, stars, tracked, is_workspace_repo, workspace_count, priority, last_captured_at";

/// Query filter for job history listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub repository_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_repository(mut self, repository_id: impl Into<String>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Raw retry counters over a time window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryWindowCounts {
    pub total_retries: u64,
    pub successful_retries: u64,
    pub average_retry_count: f64,
    pub permanent_failures: u64,
}

/// A task waiting in the dispatch outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub correlation_id: String,
    pub job_id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// SQLite-backed store for jobs, backfills, repositories and the outbox.
pub struct CaptureStore {
    db: Mutex<Connection>,
}

impl std::fmt::Debug for CaptureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStore").finish_non_exhaustive()
    }
}

impl CaptureStore {
    /// Open or create a store at the given database path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Connection::open(path)?;
        let store = Self::init(db)?;
        info!("Opened capture store at {}", path.display());
        Ok(store)
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        // In-memory databases answer "memory" here; either is fine.
        let journal_mode: String = db.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("SQLite journal mode: {}", journal_mode);
        db.execute_batch("PRAGMA busy_timeout = 5000;")?;

        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )?;

        let current: i64 = db
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
            .optional()?
            .unwrap_or(0);

        Self::run_migrations(&db, current)?;

        Ok(Self { db: Mutex::new(db) })
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(db: &Connection, from_version: i64) -> Result<()> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(CaptureError::Storage(format!(
                "database schema version {} is newer than supported version {}",
                from_version, CURRENT_SCHEMA_VERSION
            )));
        }

        if from_version < 1 {
            db.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS capture_jobs (
                    id TEXT PRIMARY KEY,
                    job_type TEXT NOT NULL,
                    repository_id TEXT NOT NULL,
                    repository_name TEXT,
                    status TEXT NOT NULL,
                    processor TEXT,
                    priority TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    created_at INTEGER NOT NULL,
                    started_at INTEGER,
                    completed_at INTEGER,
                    version INTEGER NOT NULL DEFAULT 0,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    retry_of TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON capture_jobs(status, created_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_repository ON capture_jobs(repository_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_processor ON capture_jobs(processor, status);
                CREATE INDEX IF NOT EXISTS idx_jobs_retry_of ON capture_jobs(retry_of) WHERE retry_of IS NOT NULL;

                CREATE TABLE IF NOT EXISTS job_progress (
                    job_id TEXT PRIMARY KEY,
                    total INTEGER NOT NULL,
                    processed INTEGER NOT NULL,
                    failed INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS backfill_state (
                    id TEXT PRIMARY KEY,
                    repository_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    total_items INTEGER NOT NULL,
                    processed_items INTEGER NOT NULL,
                    chunk_size INTEGER NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_backfill_one_active
                    ON backfill_state(repository_id) WHERE status = 'active';

                CREATE TABLE IF NOT EXISTS repositories (
                    id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    item_count INTEGER NOT NULL DEFAULT 0,
                    stars INTEGER NOT NULL DEFAULT 0,
                    tracked INTEGER NOT NULL DEFAULT 1,
                    is_workspace_repo INTEGER NOT NULL DEFAULT 0,
                    workspace_count INTEGER NOT NULL DEFAULT 0,
                    priority TEXT NOT NULL DEFAULT 'medium',
                    last_captured_at INTEGER
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_repositories_full_name ON repositories(owner, name);

                CREATE TABLE IF NOT EXISTS workspace_repositories (
                    workspace_id TEXT NOT NULL,
                    repository_id TEXT NOT NULL,
                    added_at INTEGER NOT NULL,
                    PRIMARY KEY (workspace_id, repository_id)
                );
                "#,
            )?;
        }

        // v2: outbox consumed by the execution fabric
        if from_version < 2 {
            db.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS dispatch_outbox (
                    correlation_id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    job_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    claimed_at INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_outbox_unclaimed
                    ON dispatch_outbox(created_at) WHERE claimed_at IS NULL;
                "#,
            )?;
        }

        db.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            [CURRENT_SCHEMA_VERSION],
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|e| CaptureError::Storage(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Capture jobs
    // ---------------------------------------------------------------------

    /// Insert a new capture job.
    pub fn insert_job(&self, job: &CaptureJob) -> Result<()> {
        let metadata = serde_json::to_string(&job.metadata)?;
        self.conn()?.execute(
            r#"
            INSERT INTO capture_jobs
            (id, job_type, repository_id, repository_name, status, processor, priority, retry_count,
             last_error, created_at, started_at, completed_at, version, metadata, retry_of)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                job.id,
                job.job_type.as_str(),
                job.repository_id,
                job.repository_name,
                job.status.as_str(),
                job.processor.map(|p| p.as_str()),
                job.priority.as_str(),
                job.retry_count as i64,
                job.last_error,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.version,
                metadata,
                job.metadata.retry_of,
            ],
        )?;
        Ok(())
    }

    /// Get a job by ID.
    pub fn get_job(&self, id: &str) -> Result<Option<CaptureJob>> {
        let db = self.conn()?;
        Self::get_job_in(&db, id)
    }

    /// Get a job by ID, failing with `JobNotFound` when missing.
    pub fn require_job(&self, id: &str) -> Result<CaptureJob> {
        self.get_job(id)?.ok_or_else(|| CaptureError::JobNotFound(id.to_string()))
    }

    fn get_job_in(db: &Connection, id: &str) -> Result<Option<CaptureJob>> {
        let sql = format!("SELECT {} FROM capture_jobs WHERE id = ?1", JOB_COLUMNS);
        Ok(db.query_row(&sql, [id], job_from_row).optional()?)
    }

    /// Apply a status transition.
    ///
    /// `started_at` is stamped the first time the job enters `processing` and
    /// never overwritten; `completed_at` is stamped on every finished status.
    /// The metadata patch is merged, never replacing the stored map.
    pub fn apply_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
        patch: MetadataPatch,
        now: i64,
    ) -> Result<CaptureJob> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let mut job = Self::get_job_in(&tx, job_id)?.ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;

        job.status = status;
        if status == JobStatus::Processing && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if status.is_finished() {
            job.completed_at = Some(now);
        }
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        job.metadata.merge(patch);
        job.version += 1;

        tx.execute(
            r#"
            UPDATE capture_jobs
            SET status = ?2, started_at = ?3, completed_at = ?4, last_error = ?5, metadata = ?6, version = ?7
            WHERE id = ?1
            "#,
            params![
                job.id,
                job.status.as_str(),
                job.started_at,
                job.completed_at,
                job.last_error,
                serde_json::to_string(&job.metadata)?,
                job.version,
            ],
        )?;
        tx.commit()?;

        Ok(job)
    }

    /// Merge a metadata patch into a job without touching its status.
    pub fn merge_metadata(&self, job_id: &str, patch: MetadataPatch) -> Result<CaptureJob> {
        self.modify_job(job_id, |job| {
            job.metadata.merge(patch);
            Ok(true)
        })?
        .ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))
    }

    /// Record the routing decision on a job.
    pub fn set_processor(&self, job_id: &str, processor: Processor, patch: MetadataPatch) -> Result<CaptureJob> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let mut job = Self::get_job_in(&tx, job_id)?.ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;
        job.processor = Some(processor);
        job.metadata.merge(patch);
        job.version += 1;
        tx.execute(
            "UPDATE capture_jobs SET processor = ?2, metadata = ?3, version = ?4 WHERE id = ?1",
            params![job.id, processor.as_str(), serde_json::to_string(&job.metadata)?, job.version],
        )?;
        tx.commit()?;
        Ok(job)
    }

    /// Read-modify-write a job's metadata inside one transaction.
    ///
    /// The closure returns whether anything changed; unchanged jobs are not
    /// written. Returns `None` when the job does not exist.
    fn modify_job<F>(&self, job_id: &str, f: F) -> Result<Option<CaptureJob>>
    where
        F: FnOnce(&mut CaptureJob) -> Result<bool>,
    {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let Some(mut job) = Self::get_job_in(&tx, job_id)? else {
            return Ok(None);
        };
        if f(&mut job)? {
            job.version += 1;
            tx.execute(
                "UPDATE capture_jobs SET metadata = ?2, version = ?3 WHERE id = ?1",
                params![job.id, serde_json::to_string(&job.metadata)?, job.version],
            )?;
        }
        tx.commit()?;
        Ok(Some(job))
    }

    /// Atomically bump a job's retry count and append a history entry.
    ///
    /// Compare-and-swap on `retry_count`: returns `false` without writing if
    /// the stored count is no longer `expected_retry_count` or already at
    /// `max_retries`.
    pub fn record_retry(
        &self,
        job_id: &str,
        expected_retry_count: u32,
        max_retries: u32,
        entry: RetryHistoryEntry,
    ) -> Result<bool> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let mut job = Self::get_job_in(&tx, job_id)?.ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;

        if job.retry_count != expected_retry_count || job.retry_count >= max_retries {
            return Ok(false);
        }

        job.metadata.retry.last_retry_at = Some(entry.timestamp);
        job.metadata.retry.history.push(entry);

        let changed = tx.execute(
            r#"
            UPDATE capture_jobs
            SET retry_count = retry_count + 1, metadata = ?3, version = version + 1
            WHERE id = ?1 AND retry_count = ?2
            "#,
            params![job.id, expected_retry_count as i64, serde_json::to_string(&job.metadata)?],
        )?;
        tx.commit()?;

        Ok(changed == 1)
    }

    /// Annotate a failed job with the replacement submitted for it.
    pub fn mark_retried(&self, job_id: &str, replacement_id: &str) -> Result<()> {
        self.modify_job(job_id, |job| {
            job.metadata.retry.retried = true;
            job.metadata
                .extra
                .insert("retried_as".into(), serde_json::Value::String(replacement_id.to_string()));
            Ok(true)
        })?
        .ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;
        Ok(())
    }

    /// Move a job to `dead_letter`, recording why.
    pub fn mark_dead_letter(&self, job_id: &str, reason: &str) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let mut job = Self::get_job_in(&tx, job_id)?.ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;
        job.metadata.retry.permanent_failure = Some(reason.to_string());
        tx.execute(
            r#"
            UPDATE capture_jobs
            SET status = 'dead_letter', metadata = ?2, version = version + 1,
                completed_at = COALESCE(completed_at, ?3)
            WHERE id = ?1
            "#,
            params![job.id, serde_json::to_string(&job.metadata)?, now_ms()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Flag a job as having consumed its retry budget.
    ///
    /// Returns whether the flag was newly set; `false` when it was already
    /// set or the job does not exist.
    pub fn mark_exhausted(&self, job_id: &str) -> Result<bool> {
        let mut flagged = false;
        self.modify_job(job_id, |job| {
            flagged = !job.metadata.retry.exhausted;
            job.metadata.retry.exhausted = true;
            Ok(flagged)
        })?;
        Ok(flagged)
    }

    /// Failed jobs created at or after `since`, oldest first.
    pub fn list_failed_since(&self, since: i64) -> Result<Vec<CaptureJob>> {
        let db = self.conn()?;
        let sql = format!(
            "SELECT {} FROM capture_jobs WHERE status = 'failed' AND created_at >= ?1 ORDER BY created_at",
            JOB_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([since], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// List jobs newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<CaptureJob>> {
        let db = self.conn()?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            r#"
            SELECT {} FROM capture_jobs
            WHERE (?1 IS NULL OR repository_id = ?1) AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3
            "#,
            JOB_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            params![filter.repository_id, filter.status.map(|s| s.as_str()), limit],
            job_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Count jobs currently processing on a processor.
    pub fn count_processing(&self, processor: Processor) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM capture_jobs WHERE processor = ?1 AND status = 'processing'",
            [processor.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Retry counters for jobs created at or after `since`.
    pub fn retry_window_counts(&self, since: i64) -> Result<RetryWindowCounts> {
        let db = self.conn()?;
        let (total, successful, average): (i64, i64, Option<f64>) = db.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                   AVG(retry_count)
            FROM capture_jobs
            WHERE retry_of IS NOT NULL AND created_at >= ?1
            "#,
            [since],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let permanent: i64 = db.query_row(
            "SELECT COUNT(*) FROM capture_jobs WHERE status = 'dead_letter' AND created_at >= ?1",
            [since],
            |row| row.get(0),
        )?;

        Ok(RetryWindowCounts {
            total_retries: total as u64,
            successful_retries: successful as u64,
            average_retry_count: average.unwrap_or(0.0),
            permanent_failures: permanent as u64,
        })
    }

    // ---------------------------------------------------------------------
    // Job progress
    // ---------------------------------------------------------------------

    /// Insert or replace the progress counters for a job.
    pub fn upsert_progress(&self, job_id: &str, progress: &JobProgress) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO job_progress (job_id, total, processed, failed, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(job_id) DO UPDATE SET
                total = excluded.total,
                processed = excluded.processed,
                failed = excluded.failed,
                updated_at = excluded.updated_at
            "#,
            params![
                job_id,
                progress.total as i64,
                progress.processed as i64,
                progress.failed as i64,
                now_ms()
            ],
        )?;
        Ok(())
    }

    pub fn get_progress(&self, job_id: &str) -> Result<Option<JobProgress>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT total, processed, failed FROM job_progress WHERE job_id = ?1",
                [job_id],
                |row| {
                    Ok(JobProgress {
                        total: row.get::<_, i64>(0)? as u64,
                        processed: row.get::<_, i64>(1)? as u64,
                        failed: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?)
    }

    // ---------------------------------------------------------------------
    // Backfill state
    // ---------------------------------------------------------------------

    /// Insert a backfill record unless the repository already has an active one.
    ///
    /// The partial unique index makes the check and the insert one statement,
    /// so concurrent initiations cannot both succeed.
    pub fn insert_backfill_if_none_active(&self, state: &BackfillState) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            INSERT OR IGNORE INTO backfill_state
            (id, repository_id, status, total_items, processed_items, chunk_size, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                state.id,
                state.repository_id,
                state.status.as_str(),
                state.total_items as i64,
                state.processed_items as i64,
                state.chunk_size as i64,
                serde_json::to_string(&state.metadata)?,
                state.created_at,
                state.updated_at,
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn get_backfill(&self, id: &str) -> Result<Option<BackfillState>> {
        let sql = format!("SELECT {} FROM backfill_state WHERE id = ?1", BACKFILL_COLUMNS);
        Ok(self.conn()?.query_row(&sql, [id], backfill_from_row).optional()?)
    }

    /// The active backfill for a repository, if any.
    pub fn active_backfill(&self, repository_id: &str) -> Result<Option<BackfillState>> {
        let sql = format!(
            "SELECT {} FROM backfill_state WHERE repository_id = ?1 AND status = 'active'",
            BACKFILL_COLUMNS
        );
        Ok(self.conn()?.query_row(&sql, [repository_id], backfill_from_row).optional()?)
    }

    /// Most recent backfill for a repository in any status.
    pub fn latest_backfill(&self, repository_id: &str) -> Result<Option<BackfillState>> {
        let sql = format!(
            "SELECT {} FROM backfill_state WHERE repository_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
            BACKFILL_COLUMNS
        );
        Ok(self.conn()?.query_row(&sql, [repository_id], backfill_from_row).optional()?)
    }

    pub fn list_backfills(&self, status: BackfillStatus) -> Result<Vec<BackfillState>> {
        let db = self.conn()?;
        let sql = format!(
            "SELECT {} FROM backfill_state WHERE status = ?1 ORDER BY created_at",
            BACKFILL_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([status.as_str()], backfill_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Write progress and status, conditional on the status still being `expected`.
    ///
    /// Returns `false` if another writer moved the record first, or if the
    /// write would create a second active record for the repository.
    pub fn update_backfill(&self, state: &BackfillState, expected: BackfillStatus) -> Result<bool> {
        let result = self.conn()?.execute(
            r#"
            UPDATE backfill_state
            SET status = ?3, processed_items = ?4, total_items = ?5, metadata = ?6, updated_at = ?7
            WHERE id = ?1 AND status = ?2
            "#,
            params![
                state.id,
                expected.as_str(),
                state.status.as_str(),
                state.processed_items as i64,
                state.total_items as i64,
                serde_json::to_string(&state.metadata)?,
                state.updated_at,
            ],
        );

        match result {
            Ok(changed) => Ok(changed == 1),
            Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---------------------------------------------------------------------
    // Repositories and workspaces
    // ---------------------------------------------------------------------

    /// Insert or update a repository record.
    pub fn upsert_repository(&self, repo: &RepositoryRecord) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO repositories
            (id, owner, name, item_count, stars, tracked, is_workspace_repo, workspace_count, priority, last_captured_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                name = excluded.name,
                item_count = excluded.item_count,
                stars = excluded.stars,
                tracked = excluded.tracked,
                is_workspace_repo = excluded.is_workspace_repo,
                workspace_count = excluded.workspace_count,
                priority = excluded.priority,
                last_captured_at = excluded.last_captured_at
            "#,
            params![
                repo.id,
                repo.owner,
                repo.name,
                repo.item_count as i64,
                repo.stars as i64,
                repo.tracked,
                repo.is_workspace_repo,
                repo.workspace_count as i64,
                repo.priority.as_str(),
                repo.last_captured_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_repository(&self, id: &str) -> Result<Option<RepositoryRecord>> {
        let sql = format!("SELECT {} FROM repositories WHERE id = ?1", REPOSITORY_COLUMNS);
        Ok(self.conn()?.query_row(&sql, [id], repository_from_row).optional()?)
    }

    pub fn find_repository(&self, owner: &str, name: &str) -> Result<Option<RepositoryRecord>> {
        let sql = format!(
            "SELECT {} FROM repositories WHERE owner = ?1 AND name = ?2",
            REPOSITORY_COLUMNS
        );
        Ok(self.conn()?.query_row(&sql, [owner, name], repository_from_row).optional()?)
    }

    pub fn list_tracked_repositories(&self) -> Result<Vec<RepositoryRecord>> {
        let db = self.conn()?;
        let sql = format!("SELECT {} FROM repositories WHERE tracked = 1 ORDER BY id", REPOSITORY_COLUMNS);
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([], repository_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Add a repository to a workspace. Returns `false` if already a member.
    pub fn add_workspace_repository(&self, workspace_id: &str, repository_id: &str) -> Result<bool> {
        let changed = self.conn()?.execute(
            "INSERT OR IGNORE INTO workspace_repositories (workspace_id, repository_id, added_at) VALUES (?1, ?2, ?3)",
            params![workspace_id, repository_id, now_ms()],
        )?;
        Ok(changed == 1)
    }

    /// Remove a repository from a workspace. Returns `false` if it was not a member.
    pub fn remove_workspace_repository(&self, workspace_id: &str, repository_id: &str) -> Result<bool> {
        let changed = self.conn()?.execute(
            "DELETE FROM workspace_repositories WHERE workspace_id = ?1 AND repository_id = ?2",
            [workspace_id, repository_id],
        )?;
        Ok(changed == 1)
    }

    /// Every repository in at least one workspace, with its membership count.
    pub fn workspace_memberships(&self) -> Result<Vec<(String, u32)>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            r#"
            SELECT repository_id, COUNT(DISTINCT workspace_id)
            FROM workspace_repositories
            GROUP BY repository_id
            ORDER BY repository_id
            "#,
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn workspace_count(&self, repository_id: &str) -> Result<u32> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(DISTINCT workspace_id) FROM workspace_repositories WHERE repository_id = ?1",
            [repository_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Write placement facts, only if they differ from what is stored.
    ///
    /// Returns whether a row was written.
    pub fn set_placement(
        &self,
        repository_id: &str,
        priority: RepositoryPriority,
        is_workspace_repo: bool,
        workspace_count: u32,
    ) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE repositories
            SET priority = ?2, is_workspace_repo = ?3, workspace_count = ?4
            WHERE id = ?1 AND (priority != ?2 OR is_workspace_repo != ?3 OR workspace_count != ?4)
            "#,
            params![repository_id, priority.as_str(), is_workspace_repo, workspace_count as i64],
        )?;
        Ok(changed == 1)
    }

    pub fn touch_captured(&self, repository_id: &str, at: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE repositories SET last_captured_at = ?2 WHERE id = ?1",
            params![repository_id, at],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Dispatch outbox
    // ---------------------------------------------------------------------

    /// Enqueue a task for the execution fabric.
    ///
    /// Keyed by correlation id: a repeat submission leaves the original row in
    /// place and returns its job id.
    pub fn enqueue_outbox(
        &self,
        correlation_id: &str,
        job_id: &str,
        job_type: &str,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let db = self.conn()?;
        db.execute(
            r#"
            INSERT OR IGNORE INTO dispatch_outbox (correlation_id, job_id, job_type, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![correlation_id, job_id, job_type, serde_json::to_string(payload)?, now_ms()],
        )?;
        let stored: String = db.query_row(
            "SELECT job_id FROM dispatch_outbox WHERE correlation_id = ?1",
            [correlation_id],
            |row| row.get(0),
        )?;
        Ok(stored)
    }

    /// Unclaimed outbox entries, oldest first.
    pub fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            r#"
            SELECT correlation_id, job_id, job_type, payload, created_at
            FROM dispatch_outbox WHERE claimed_at IS NULL
            ORDER BY created_at LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let payload: String = row.get(3)?;
            Ok(OutboxEntry {
                correlation_id: row.get(0)?,
                job_id: row.get(1)?,
                job_type: row.get(2)?,
                payload: serde_json::from_str(&payload).map_err(|e| conversion_error(3, e))?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = CaptureError>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CaptureJob> {
    let processor: Option<String> = row.get(5)?;
    let processor = match processor {
        Some(text) => Some(text.parse::<Processor>().map_err(|e| conversion_error(5, e))?),
        None => None,
    };
    let metadata: JobMetadata = json_col(row, 13)?;

    Ok(CaptureJob {
        id: row.get(0)?,
        job_type: parse_col(row, 1)?,
        repository_id: row.get(2)?,
        repository_name: row.get(3)?,
        status: parse_col(row, 4)?,
        processor,
        priority: parse_col(row, 6)?,
        retry_count: row.get::<_, i64>(7)? as u32,
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        version: row.get(12)?,
        metadata,
    })
}

fn backfill_from_row(row: &Row<'_>) -> rusqlite::Result<BackfillState> {
    Ok(BackfillState {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        status: parse_col(row, 2)?,
        total_items: row.get::<_, i64>(3)? as u64,
        processed_items: row.get::<_, i64>(4)? as u64,
        chunk_size: row.get::<_, i64>(5)? as u32,
        metadata: json_col(row, 6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<RepositoryRecord> {
    Ok(RepositoryRecord {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        item_count: row.get::<_, i64>(3)? as u64,
        stars: row.get::<_, i64>(4)? as u64,
        tracked: row.get(5)?,
        is_workspace_repo: row.get(6)?,
        workspace_count: row.get::<_, i64>(7)? as u32,
        priority: parse_col(row, 8)?,
        last_captured_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::{JobType, PriorityClass};
    use tempfile::TempDir;

    fn store() -> CaptureStore {
        CaptureStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_insert_and_get_job() {
        let store = store();
        let job = CaptureJob::new(JobType::RecentSync, "repo-1")
            .with_priority(PriorityClass::High)
            .with_time_range(1.0);
        store.insert_job(&job).unwrap();

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded, job);
    }

    #[test]
    fn test_require_job_missing() {
        let err = store().require_job("nope").unwrap_err();
        assert!(matches!(err, CaptureError::JobNotFound(_)));
    }

    #[test]
    fn test_apply_status_stamps_started_once() {
        let store = store();
        let job = CaptureJob::new(JobType::Reviews, "repo-1");
        store.insert_job(&job).unwrap();

        let first = store
            .apply_status(&job.id, JobStatus::Processing, None, MetadataPatch::default(), 1_000)
            .unwrap();
        assert_eq!(first.started_at, Some(1_000));

        let second = store
            .apply_status(&job.id, JobStatus::Processing, None, MetadataPatch::default(), 2_000)
            .unwrap();
        assert_eq!(second.started_at, Some(1_000));

        let done = store
            .apply_status(&job.id, JobStatus::Completed, None, MetadataPatch::default(), 3_000)
            .unwrap();
        assert_eq!(done.completed_at, Some(3_000));
        assert_eq!(done.version, 3);
    }

    #[test]
    fn test_apply_status_persists_error() {
        let store = store();
        let job = CaptureJob::new(JobType::Comments, "repo-1");
        store.insert_job(&job).unwrap();

        store
            .apply_status(&job.id, JobStatus::Failed, Some("timeout"), MetadataPatch::default(), 5)
            .unwrap();
        let loaded = store.require_job(&job.id).unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_mark_exhausted_reports_first_flag_only() {
        let store = store();
        let job = CaptureJob::new(JobType::Reviews, "repo-1");
        store.insert_job(&job).unwrap();

        assert!(store.mark_exhausted(&job.id).unwrap());
        let version = store.require_job(&job.id).unwrap().version;
        assert!(!store.mark_exhausted(&job.id).unwrap());
        assert_eq!(store.require_job(&job.id).unwrap().version, version);
        assert!(!store.mark_exhausted("missing").unwrap());
    }

    #[test]
    fn test_record_retry_compare_and_swap() {
        let store = store();
        let job = CaptureJob::new(JobType::RecentSync, "repo-1");
        store.insert_job(&job).unwrap();

        let entry = RetryHistoryEntry {
            attempt: 1,
            timestamp: 42,
            previous_error: Some("boom".into()),
        };
        assert!(store.record_retry(&job.id, 0, 3, entry.clone()).unwrap());
        // Stale expectation loses
        assert!(!store.record_retry(&job.id, 0, 3, entry.clone()).unwrap());

        let loaded = store.require_job(&job.id).unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.metadata.retry.last_retry_at, Some(42));
        assert_eq!(loaded.metadata.retry.history.len(), 1);
        assert!(!loaded.metadata.retry.retried);

        store.mark_retried(&job.id, "job-next").unwrap();
        let loaded = store.require_job(&job.id).unwrap();
        assert!(loaded.metadata.retry.retried);
        assert_eq!(loaded.metadata.extra["retried_as"], "job-next");
    }

    #[test]
    fn test_record_retry_respects_max() {
        let store = store();
        let mut job = CaptureJob::new(JobType::RecentSync, "repo-1");
        job.retry_count = 3;
        store.insert_job(&job).unwrap();

        let entry = RetryHistoryEntry {
            attempt: 4,
            timestamp: 1,
            previous_error: None,
        };
        assert!(!store.record_retry(&job.id, 3, 3, entry).unwrap());
        assert_eq!(store.require_job(&job.id).unwrap().retry_count, 3);
    }

    #[test]
    fn test_list_jobs_filters() {
        let store = store();
        let mut a = CaptureJob::new(JobType::RecentSync, "repo-a");
        a.created_at = 1;
        let mut b = CaptureJob::new(JobType::RecentSync, "repo-b");
        b.created_at = 2;
        b.status = JobStatus::Failed;
        let mut c = CaptureJob::new(JobType::Reviews, "repo-a");
        c.created_at = 3;
        for job in [&a, &b, &c] {
            store.insert_job(job).unwrap();
        }

        let all = store.list_jobs(&JobFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, c.id);

        let repo_a = store.list_jobs(&JobFilter::default().with_repository("repo-a")).unwrap();
        assert_eq!(repo_a.len(), 2);

        let failed = store.list_jobs(&JobFilter::default().with_status(JobStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, b.id);

        let limited = store.list_jobs(&JobFilter::default().with_limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_count_processing() {
        let store = store();
        let mut job = CaptureJob::new(JobType::RecentSync, "repo-1");
        job.processor = Some(Processor::Batch);
        job.status = JobStatus::Processing;
        store.insert_job(&job).unwrap();

        assert_eq!(store.count_processing(Processor::Batch).unwrap(), 1);
        assert_eq!(store.count_processing(Processor::LowLatency).unwrap(), 0);
    }

    #[test]
    fn test_progress_upsert() {
        let store = store();
        let progress = JobProgress {
            total: 10,
            processed: 4,
            failed: 1,
        };
        store.upsert_progress("job-1", &progress).unwrap();
        store
            .upsert_progress(
                "job-1",
                &JobProgress {
                    total: 10,
                    processed: 9,
                    failed: 1,
                },
            )
            .unwrap();
        assert_eq!(store.get_progress("job-1").unwrap().unwrap().processed, 9);
        assert!(store.get_progress("job-2").unwrap().is_none());
    }

    #[test]
    fn test_single_active_backfill_per_repository() {
        let store = store();
        let first = BackfillState::new("repo-1", 500, 10, 25);
        let second = BackfillState::new("repo-1", 500, 10, 25);

        assert!(store.insert_backfill_if_none_active(&first).unwrap());
        assert!(!store.insert_backfill_if_none_active(&second).unwrap());
        assert_eq!(store.active_backfill("repo-1").unwrap().unwrap().id, first.id);
    }

    #[test]
    fn test_update_backfill_conditional_on_status() {
        let store = store();
        let mut state = BackfillState::new("repo-1", 100, 0, 25);
        store.insert_backfill_if_none_active(&state).unwrap();

        state.status = BackfillStatus::Paused;
        assert!(store.update_backfill(&state, BackfillStatus::Active).unwrap());
        // Already paused: stale expectation
        assert!(!store.update_backfill(&state, BackfillStatus::Active).unwrap());
        assert_eq!(
            store.get_backfill(&state.id).unwrap().unwrap().status,
            BackfillStatus::Paused
        );
    }

    #[test]
    fn test_set_placement_only_writes_changes() {
        let store = store();
        store
            .upsert_repository(&RepositoryRecord::new("r1", "octo", "widgets", 10))
            .unwrap();

        assert!(store.set_placement("r1", RepositoryPriority::High, true, 2).unwrap());
        assert!(!store.set_placement("r1", RepositoryPriority::High, true, 2).unwrap());

        let repo = store.get_repository("r1").unwrap().unwrap();
        assert_eq!(repo.priority, RepositoryPriority::High);
        assert!(repo.is_workspace_repo);
        assert_eq!(repo.workspace_count, 2);
    }

    #[test]
    fn test_workspace_memberships() {
        let store = store();
        assert!(store.add_workspace_repository("ws-1", "r1").unwrap());
        assert!(!store.add_workspace_repository("ws-1", "r1").unwrap());
        store.add_workspace_repository("ws-2", "r1").unwrap();
        store.add_workspace_repository("ws-2", "r2").unwrap();

        let memberships = store.workspace_memberships().unwrap();
        assert_eq!(memberships, vec![("r1".to_string(), 2), ("r2".to_string(), 1)]);

        assert!(store.remove_workspace_repository("ws-2", "r1").unwrap());
        assert_eq!(store.workspace_count("r1").unwrap(), 1);
    }

    #[test]
    fn test_outbox_is_idempotent_by_correlation_id() {
        let store = store();
        let payload = serde_json::json!({"job_id": "job-1"});
        let first = store.enqueue_outbox("corr-1", "job-1", "recent-sync", &payload).unwrap();
        let second = store.enqueue_outbox("corr-1", "job-2", "recent-sync", &payload).unwrap();

        assert_eq!(first, "job-1");
        assert_eq!(second, "job-1");
        assert_eq!(store.pending_outbox(10).unwrap().len(), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("capture.db");
        let job = CaptureJob::new(JobType::CommitAnalysis, "repo-1");

        {
            let store = CaptureStore::open(&path).unwrap();
            store.insert_job(&job).unwrap();
        }

        let store = CaptureStore::open(&path).unwrap();
        assert_eq!(store.require_job(&job.id).unwrap().job_type, JobType::CommitAnalysis);
    }
}
