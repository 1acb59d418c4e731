//! Routing factors.
//!
//! Each factor is normalized to `[0, 1]`; higher values favor the
//! low-latency processor.

use serde::{Deserialize, Serialize};

use crate::store::PriorityClass;

/// Weights applied to the five factors. They sum to 1.0 by default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub time_sensitivity: f64,
    pub batch_size: f64,
    pub repo_size: f64,
    pub data_age: f64,
    pub priority: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            time_sensitivity: 0.3,
            batch_size: 0.2,
            repo_size: 0.2,
            data_age: 0.2,
            priority: 0.1,
        }
    }
}

/// Factor values for one decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Factors {
    pub time_sensitivity: f64,
    pub batch_size: f64,
    pub repo_size: f64,
    pub data_age: f64,
    pub priority: f64,
}

impl Factors {
    /// Weighted sum, clamped to `[0, 1]`.
    pub fn low_latency_score(&self, weights: &FactorWeights) -> f64 {
        let score = self.time_sensitivity * weights.time_sensitivity
            + self.batch_size * weights.batch_size
            + self.repo_size * weights.repo_size
            + self.data_age * weights.data_age
            + self.priority * weights.priority;
        score.clamp(0.0, 1.0)
    }
}

pub fn time_sensitivity(time_range_days: f64) -> f64 {
    if time_range_days <= 1.0 {
        1.0
    } else if time_range_days <= 7.0 {
        0.6
    } else if time_range_days <= 30.0 {
        0.3
    } else {
        0.1
    }
}

/// Unbounded requests sit in the middle.
pub fn batch_size(max_items: Option<u32>) -> f64 {
    match max_items {
        None => 0.5,
        Some(n) if n <= 50 => 1.0,
        Some(n) if n <= 200 => 0.7,
        Some(n) if n <= 1000 => 0.4,
        Some(_) => 0.1,
    }
}

pub fn repo_size(item_count: u64, large_repo_threshold: u64) -> f64 {
    if item_count > large_repo_threshold { 0.2 } else { 0.8 }
}

pub fn data_age(time_range_days: f64, historical_days: f64) -> f64 {
    if time_range_days > historical_days { 0.2 } else { 0.9 }
}

pub fn priority(class: PriorityClass) -> f64 {
    match class {
        PriorityClass::Low => 0.25,
        PriorityClass::Medium => 0.5,
        PriorityClass::High => 0.75,
        PriorityClass::Critical => 1.0,
    }
}
