//! Repository placement sync.
//!
//! Workspace repositories are `high` priority with their membership count;
//! every other tracked repository is `medium` with no workspace flag. Writes
//! only happen when the stored facts differ, so re-running a sync over
//! unchanged memberships writes nothing.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use crate::error::{CaptureError, Result};
use crate::store::{CaptureStore, RepositoryPriority};

/// What a full sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Workspace repositories examined
    pub workspace_repos: usize,
    /// Tracked-only repositories examined
    pub tracked_only: usize,
    pub promoted: Vec<String>,
    pub demoted: Vec<String>,
    /// Rows actually written
    pub writes: usize,
}

pub struct PlacementSync {
    store: Arc<CaptureStore>,
}

impl PlacementSync {
    pub fn new(store: Arc<CaptureStore>) -> Self {
        Self { store }
    }

    /// Recompute placement for every tracked and workspace repository.
    pub fn full_sync(&self) -> Result<SyncReport> {
        let memberships: HashMap<String, u32> = self.store.workspace_memberships()?.into_iter().collect();
        let mut report = SyncReport::default();

        let mut members: Vec<_> = memberships.iter().collect();
        members.sort();
        for (repository_id, count) in members {
            report.workspace_repos += 1;
            let was_workspace = self.is_workspace_repo(repository_id)?;
            if self.store.set_placement(repository_id, RepositoryPriority::High, true, *count)? {
                report.writes += 1;
                if !was_workspace {
                    report.promoted.push(repository_id.clone());
                }
            }
        }

        for repo in self.store.list_tracked_repositories()? {
            if memberships.contains_key(&repo.id) {
                continue;
            }
            report.tracked_only += 1;
            if self.store.set_placement(&repo.id, RepositoryPriority::Medium, false, 0)? {
                report.writes += 1;
                if repo.is_workspace_repo {
                    report.demoted.push(repo.id);
                }
            }
        }

        info!(
            "Placement sync: {} workspace, {} tracked-only, {} promoted, {} demoted, {} writes",
            report.workspace_repos,
            report.tracked_only,
            report.promoted.len(),
            report.demoted.len(),
            report.writes
        );
        Ok(report)
    }

    /// Apply workspace placement to one repository after it joined a workspace.
    ///
    /// Returns whether anything was written.
    pub fn mark_as_workspace_repo(&self, repository_id: &str) -> Result<bool> {
        self.require(repository_id)?;
        let count = self.store.workspace_count(repository_id)?.max(1);
        let written = self.store.set_placement(repository_id, RepositoryPriority::High, true, count)?;
        debug!("{} marked as workspace repo (count={}, written={})", repository_id, count, written);
        Ok(written)
    }

    /// Apply tracked-only placement after a repository left its last workspace.
    ///
    /// A repository still in another workspace keeps workspace placement with
    /// its reduced count.
    pub fn mark_as_tracked_only(&self, repository_id: &str) -> Result<bool> {
        self.require(repository_id)?;
        let remaining = self.store.workspace_count(repository_id)?;
        if remaining > 0 {
            return Ok(self
                .store
                .set_placement(repository_id, RepositoryPriority::High, true, remaining)?);
        }
        let written = self.store.set_placement(repository_id, RepositoryPriority::Medium, false, 0)?;
        debug!("{} marked as tracked-only (written={})", repository_id, written);
        Ok(written)
    }

    fn is_workspace_repo(&self, repository_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get_repository(repository_id)?
            .map(|repo| repo.is_workspace_repo)
            .unwrap_or(false))
    }

    fn require(&self, repository_id: &str) -> Result<()> {
        match self.store.get_repository(repository_id)? {
            Some(_) => Ok(()),
            None => Err(CaptureError::RepositoryNotFound(repository_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RepositoryRecord;

    fn setup() -> (PlacementSync, Arc<CaptureStore>) {
        let store = Arc::new(CaptureStore::open_in_memory().unwrap());
        for (id, name) in [("r1", "alpha"), ("r2", "beta"), ("r3", "gamma")] {
            store.upsert_repository(&RepositoryRecord::new(id, "octo", name, 100)).unwrap();
        }
        (PlacementSync::new(store.clone()), store)
    }

    #[test]
    fn test_full_sync_promotes_and_demotes() {
        let (sync, store) = setup();
        store.add_workspace_repository("ws-1", "r1").unwrap();
        store.add_workspace_repository("ws-2", "r1").unwrap();

        let mut previously = store.get_repository("r2").unwrap().unwrap();
        previously.is_workspace_repo = true;
        previously.priority = RepositoryPriority::High;
        previously.workspace_count = 1;
        store.upsert_repository(&previously).unwrap();

        let report = sync.full_sync().unwrap();
        assert_eq!(report.promoted, vec!["r1".to_string()]);
        assert_eq!(report.demoted, vec!["r2".to_string()]);
        assert_eq!(report.workspace_repos, 1);
        assert_eq!(report.tracked_only, 2);

        let r1 = store.get_repository("r1").unwrap().unwrap();
        assert_eq!(r1.priority, RepositoryPriority::High);
        assert!(r1.is_workspace_repo);
        assert_eq!(r1.workspace_count, 2);

        let r2 = store.get_repository("r2").unwrap().unwrap();
        assert_eq!(r2.priority, RepositoryPriority::Medium);
        assert!(!r2.is_workspace_repo);
        assert_eq!(r2.workspace_count, 0);
    }

    #[test]
    fn test_second_sync_writes_nothing() {
        let (sync, store) = setup();
        store.add_workspace_repository("ws-1", "r3").unwrap();

        let first = sync.full_sync().unwrap();
        assert!(first.writes > 0);

        let second = sync.full_sync().unwrap();
        assert_eq!(second.writes, 0);
        assert!(second.promoted.is_empty());
        assert!(second.demoted.is_empty());
    }

    #[test]
    fn test_incremental_marks() {
        let (sync, store) = setup();
        store.add_workspace_repository("ws-1", "r2").unwrap();
        assert!(sync.mark_as_workspace_repo("r2").unwrap());
        assert!(!sync.mark_as_workspace_repo("r2").unwrap());

        store.remove_workspace_repository("ws-1", "r2").unwrap();
        assert!(sync.mark_as_tracked_only("r2").unwrap());
        let r2 = store.get_repository("r2").unwrap().unwrap();
        assert_eq!(r2.priority, RepositoryPriority::Medium);
        assert!(!r2.is_workspace_repo);
    }

    #[test]
    fn test_tracked_only_keeps_remaining_workspaces() {
        let (sync, store) = setup();
        store.add_workspace_repository("ws-1", "r1").unwrap();
        store.add_workspace_repository("ws-2", "r1").unwrap();
        sync.mark_as_workspace_repo("r1").unwrap();

        store.remove_workspace_repository("ws-1", "r1").unwrap();
        sync.mark_as_tracked_only("r1").unwrap();
        let r1 = store.get_repository("r1").unwrap().unwrap();
        assert!(r1.is_workspace_repo);
        assert_eq!(r1.workspace_count, 1);
    }

    #[test]
    fn test_unknown_repository() {
        let (sync, _) = setup();
        let err = sync.mark_as_workspace_repo("missing").unwrap_err();
        assert!(err.is_not_found());
    }
}
