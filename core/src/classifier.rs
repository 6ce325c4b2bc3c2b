//! Score → ordinal risk category.

use crate::types::Score;
use serde::{Deserialize, Serialize};

/// Ordinal risk bucket. Declaration order is the ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl RiskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VeryLow  => "very_low",
            Self::Low      => "low",
            Self::Medium   => "medium",
            Self::High     => "high",
            Self::VeryHigh => "very_high",
        }
    }
}

/// One row of the classification table: scores at or above
/// `min_score` (and below the previous row's) map to `category`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryThreshold {
    pub category:  RiskCategory,
    pub min_score: Score,
}

/// Evaluate the table top-down; a score equal to a threshold lands in
/// the higher category.
///
/// Validated tables descend strictly and end at `min_score = 0`, so the
/// fallback only applies to hand-built tables.
pub fn classify(score: Score, table: &[CategoryThreshold]) -> RiskCategory {
    table
        .iter()
        .find(|t| score >= t.min_score)
        .map(|t| t.category)
        .unwrap_or(RiskCategory::VeryLow)
}
