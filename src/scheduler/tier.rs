//! Concurrency tiers.
//!
//! One tier is active per deployment. It bounds the limiter's admission
//! decisions and is never mutated at runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};

/// Deployment tier name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierName::Free => write!(f, "free"),
            TierName::Pro => write!(f, "pro"),
            TierName::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Admission limits for one processor.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyTier {
    pub name: TierName,
    pub max_concurrent: usize,
    /// Overflow allowance above `max_concurrent`; never below it
    pub burst_capacity: usize,
    /// Admission pause armed once concurrency passes 80% of the maximum
    pub cooldown: Duration,
    pub queue_capacity: usize,
}

impl ConcurrencyTier {
    pub fn free() -> Self {
        Self {
            name: TierName::Free,
            max_concurrent: 5,
            burst_capacity: 8,
            cooldown: Duration::from_secs(5),
            queue_capacity: 50,
        }
    }

    pub fn pro() -> Self {
        Self {
            name: TierName::Pro,
            max_concurrent: 20,
            burst_capacity: 30,
            cooldown: Duration::from_secs(2),
            queue_capacity: 200,
        }
    }

    pub fn enterprise() -> Self {
        Self {
            name: TierName::Enterprise,
            max_concurrent: 100,
            burst_capacity: 150,
            cooldown: Duration::from_secs(1),
            queue_capacity: 1000,
        }
    }

    /// Built-in limits for a tier name.
    pub fn for_name(name: TierName) -> Self {
        match name {
            TierName::Free => Self::free(),
            TierName::Pro => Self::pro(),
            TierName::Enterprise => Self::enterprise(),
        }
    }

    /// Check the limits are coherent.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(CaptureError::Config(format!(
                "tier {}: max_concurrent must be at least 1",
                self.name
            )));
        }
        if self.burst_capacity < self.max_concurrent {
            return Err(CaptureError::Config(format!(
                "tier {}: burst_capacity {} is below max_concurrent {}",
                self.name, self.burst_capacity, self.max_concurrent
            )));
        }
        Ok(())
    }
}

impl Default for ConcurrencyTier {
    fn default() -> Self {
        Self::free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tiers_are_valid() {
        for name in [TierName::Free, TierName::Pro, TierName::Enterprise] {
            let tier = ConcurrencyTier::for_name(name);
            assert_eq!(tier.name, name);
            tier.validate().unwrap();
            assert!(tier.burst_capacity >= tier.max_concurrent);
        }
    }

    #[test]
    fn test_validate_rejects_small_burst() {
        let tier = ConcurrencyTier {
            burst_capacity: 2,
            ..ConcurrencyTier::free()
        };
        let err = tier.validate().unwrap_err();
        assert!(err.to_string().contains("burst_capacity"));
    }

    #[test]
    fn test_tier_name_serde() {
        let name: TierName = serde_yaml::from_str("enterprise").unwrap();
        assert_eq!(name, TierName::Enterprise);
        assert_eq!(TierName::Pro.to_string(), "pro");
    }
}
