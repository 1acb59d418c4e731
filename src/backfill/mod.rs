//! Backfill state tracker.
//!
//! Tracks a repository's chunked historical capture. States move
//! `active -> paused | completed | failed` and `paused -> active`; a
//! repository has at most one active record, enforced by the store.

use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::id::now_ms;
use crate::store::{
    BackfillState, BackfillStatus, CaptureJob, CaptureStore, JobType, PriorityClass, RepositoryRecord, TriggerSource,
};

/// Attempts at a conditional progress write before giving up.
const MAX_CAS_ATTEMPTS: usize = 5;

/// Backfill tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Repositories smaller than this are never backfilled
    pub min_items: u64,
    /// Captured/known ratio at or above which a repository counts as complete
    pub completeness_threshold: f64,
    pub chunk_size: u32,
    /// Time window recent-sync jobs are narrowed to while a backfill runs
    pub recent_window_days: f64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            min_items: 100,
            completeness_threshold: 0.8,
            chunk_size: 25,
            recent_window_days: 1.0,
        }
    }
}

/// Why a repository does not qualify for a backfill.
#[derive(Debug, Clone, PartialEq)]
pub enum Ineligible {
    TooSmall { item_count: u64 },
    AlreadyComplete { ratio: f64 },
}

impl std::fmt::Display for Ineligible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligible::TooSmall { item_count } => write!(f, "only {} items", item_count),
            Ineligible::AlreadyComplete { ratio } => write!(f, "{:.0}% already captured", ratio * 100.0),
        }
    }
}

/// Result of an initiation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum InitiationOutcome {
    Initiated(BackfillState),
    /// Another backfill is already running; nothing was written
    AlreadyActive(BackfillState),
    NotEligible(Ineligible),
}

pub struct BackfillTracker {
    config: BackfillConfig,
    store: Arc<CaptureStore>,
}

impl BackfillTracker {
    pub fn new(config: BackfillConfig, store: Arc<CaptureStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Size and completeness rule, ignoring existing backfills.
    pub fn qualifies(&self, item_count: u64, captured: u64) -> std::result::Result<(), Ineligible> {
        if item_count < self.config.min_items {
            return Err(Ineligible::TooSmall { item_count });
        }
        let ratio = captured as f64 / item_count as f64;
        if ratio >= self.config.completeness_threshold {
            return Err(Ineligible::AlreadyComplete { ratio });
        }
        Ok(())
    }

    /// Start a backfill for `repo` if it qualifies and none is active.
    ///
    /// Concurrent attempts for the same repository are safe: exactly one
    /// inserts, the rest observe `AlreadyActive`.
    pub fn initiate(&self, repo: &RepositoryRecord, captured: u64) -> Result<InitiationOutcome> {
        if let Err(reason) = self.qualifies(repo.item_count, captured) {
            return Ok(InitiationOutcome::NotEligible(reason));
        }

        if let Some(active) = self.store.active_backfill(&repo.id)? {
            return Ok(InitiationOutcome::AlreadyActive(active));
        }

        let state = BackfillState::new(repo.id.clone(), repo.item_count, captured, self.config.chunk_size);
        if self.store.insert_backfill_if_none_active(&state)? {
            info!(
                "Backfill {} started for {}: {}/{} items",
                state.id,
                repo.full_name(),
                captured,
                repo.item_count
            );
            return Ok(InitiationOutcome::Initiated(state));
        }

        // Lost the race
        match self.store.active_backfill(&repo.id)? {
            Some(active) => Ok(InitiationOutcome::AlreadyActive(active)),
            None => Err(CaptureError::InvalidState(format!(
                "backfill for {} could not be created",
                repo.id
            ))),
        }
    }

    pub fn active(&self, repository_id: &str) -> Result<Option<BackfillState>> {
        self.store.active_backfill(repository_id)
    }

    pub fn get(&self, backfill_id: &str) -> Result<BackfillState> {
        self.store
            .get_backfill(backfill_id)?
            .ok_or_else(|| CaptureError::InvalidState(format!("backfill {} not found", backfill_id)))
    }

    /// Record items captured by one chunk job.
    ///
    /// Completes the backfill once `processed >= total`. A chunk that
    /// captured nothing means upstream has no more history, which also
    /// completes it.
    pub fn record_chunk(&self, backfill_id: &str, items: u64) -> Result<BackfillState> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut state = self.get(backfill_id)?;
            if state.status != BackfillStatus::Active {
                return Err(CaptureError::InvalidState(format!(
                    "backfill {} is {}, not active",
                    backfill_id, state.status
                )));
            }

            state.processed_items += items;
            state.updated_at = now_ms();
            if state.is_done() || items == 0 {
                state.status = BackfillStatus::Completed;
                if items == 0 && !state.is_done() {
                    state
                        .metadata
                        .insert("upstream_exhausted".into(), serde_json::Value::Bool(true));
                }
            }

            if self.store.update_backfill(&state, BackfillStatus::Active)? {
                if state.status == BackfillStatus::Completed {
                    info!(
                        "Backfill {} completed: {}/{} items",
                        state.id, state.processed_items, state.total_items
                    );
                }
                return Ok(state);
            }
        }

        Err(CaptureError::Storage(format!(
            "backfill {} progress update kept conflicting",
            backfill_id
        )))
    }

    pub fn pause(&self, backfill_id: &str) -> Result<BackfillState> {
        self.transition(backfill_id, BackfillStatus::Paused, None)
    }

    /// Resume a paused backfill. Fails if the repository started another one.
    pub fn resume(&self, backfill_id: &str) -> Result<BackfillState> {
        self.transition(backfill_id, BackfillStatus::Active, None)
    }

    pub fn fail(&self, backfill_id: &str, error: &str) -> Result<BackfillState> {
        self.transition(backfill_id, BackfillStatus::Failed, Some(error))
    }

    fn transition(&self, backfill_id: &str, next: BackfillStatus, error: Option<&str>) -> Result<BackfillState> {
        let mut state = self.get(backfill_id)?;
        let current = state.status;
        if !current.can_transition_to(next) {
            return Err(CaptureError::InvalidState(format!(
                "backfill {} cannot move from {} to {}",
                backfill_id, current, next
            )));
        }

        state.status = next;
        state.updated_at = now_ms();
        if let Some(error) = error {
            state
                .metadata
                .insert("error".into(), serde_json::Value::String(error.to_string()));
        }

        if !self.store.update_backfill(&state, current)? {
            warn!("Backfill {} transition to {} lost a race", backfill_id, next);
            return Err(CaptureError::InvalidState(format!(
                "backfill {} changed concurrently",
                backfill_id
            )));
        }
        Ok(state)
    }

    /// The next chunk job for an active backfill.
    pub fn chunk_job(&self, state: &BackfillState) -> CaptureJob {
        let mut job = CaptureJob::new(JobType::BackfillChunk, state.repository_id.clone())
            .with_priority(PriorityClass::Low)
            .with_max_items(state.chunk_size)
            .with_trigger(TriggerSource::Backfill);
        job.metadata
            .extra
            .insert("backfill_id".into(), serde_json::Value::String(state.id.clone()));
        job
    }
}

/// Backfill id carried by a chunk job.
pub fn backfill_id_of(job: &CaptureJob) -> Option<&str> {
    job.metadata.extra.get("backfill_id").and_then(|v| v.as_str())
}
