//! Per-decision repository profile.

use crate::store::{BackfillState, PriorityClass, RepositoryPriority, RepositoryRecord};

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Everything the router knows about a repository at decision time.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingProfile {
    pub repository: RepositoryRecord,
    /// The repository's active backfill, if one is running
    pub active_backfill: Option<BackfillState>,
    /// Processing jobs on the low-latency processor over its capacity, in `[0, 1]`
    pub low_latency_load: f64,
    pub batch_load: f64,
    /// Placement score in `[0, 1]`
    pub priority_score: f64,
}

/// Placement score assembled from workspace membership, popularity and staleness.
///
/// Workspace placement carries half the weight; popularity (stars, log
/// scale) and staleness (hours since last capture, saturating at a day)
/// a quarter each.
pub fn placement_score(repo: &RepositoryRecord, now_ms: i64) -> f64 {
    let placement = match repo.priority {
        RepositoryPriority::High => 0.8,
        RepositoryPriority::Medium => 0.4,
        RepositoryPriority::Low => 0.0,
    };
    let membership = 0.1 * repo.workspace_count.min(2) as f64;
    let workspace = (placement + membership).min(1.0);

    let popularity = ((repo.stars.saturating_add(1) as f64).log10() / 4.0).min(1.0);

    let staleness = match repo.last_captured_at {
        None => 1.0,
        Some(at) => (now_ms.saturating_sub(at).max(0) as f64 / (24 * HOUR_MS) as f64).min(1.0),
    };

    0.5 * workspace + 0.25 * popularity + 0.25 * staleness
}

/// Priority class for a job that did not request one.
pub fn priority_for_score(score: f64) -> PriorityClass {
    if score >= 0.8 {
        PriorityClass::Critical
    } else if score >= 0.55 {
        PriorityClass::High
    } else if score >= 0.25 {
        PriorityClass::Medium
    } else {
        PriorityClass::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extreme_counts_stay_in_range() {
        let mut repo = RepositoryRecord::new("r1", "octo", "a", 10);
        repo.stars = u64::MAX;
        repo.last_captured_at = Some(i64::MIN);
        let score = placement_score(&repo, i64::MAX);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_workspace_repo_outranks_tracked_only() {
        let now = 10 * 24 * HOUR_MS;
        let mut tracked = RepositoryRecord::new("r1", "octo", "a", 10);
        tracked.last_captured_at = Some(now);
        let mut workspace = tracked.clone();
        workspace.priority = RepositoryPriority::High;
        workspace.is_workspace_repo = true;
        workspace.workspace_count = 1;

        assert!(placement_score(&workspace, now) > placement_score(&tracked, now));
    }

    #[test]
    fn test_stale_workspace_repo_is_high() {
        let mut repo = RepositoryRecord::new("r1", "octo", "a", 10);
        repo.priority = RepositoryPriority::High;
        repo.workspace_count = 1;
        let score = placement_score(&repo, 0);
        assert_eq!(priority_for_score(score), PriorityClass::High);
    }

    #[test]
    fn test_fresh_unpopular_repo_is_low() {
        let mut repo = RepositoryRecord::new("r1", "octo", "a", 10);
        repo.priority = RepositoryPriority::Low;
        repo.last_captured_at = Some(1_000);
        assert_eq!(priority_for_score(placement_score(&repo, 1_000)), PriorityClass::Low);
    }
}
