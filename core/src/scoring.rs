//! Risk scoring: FeatureVector → additive integer score.
//!
//! Each rule is a cascade of tiers evaluated top-down. The first tier
//! that holds contributes its points and the rest of the rule is
//! skipped. Contributions are summed across rules.
//!
//! Global invariants enforced:
//! - Deterministic: same FeatureVector + rules → same score
//! - Invalid feature vectors are rejected, never clamped
//! - Undefined feature values never satisfy a tier

use crate::{
    error::PipelineResult,
    features::{FeatureName, FeatureVector},
    types::Score,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
        }
    }

    /// `gt` / `ge` cascades walk thresholds downwards, `lt` / `le` upwards.
    pub fn is_lower_bound(self) -> bool {
        matches!(self, Self::Gt | Self::Ge)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// Right-hand side of a tier: a constant or another feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Constant(f64),
    Feature { feature: FeatureName },
}

impl Operand {
    fn resolve(&self, features: &FeatureVector) -> Option<f64> {
        match self {
            Self::Constant(v)         => Some(*v),
            Self::Feature { feature } => features.value(*feature),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tier {
    pub op:     Comparison,
    pub value:  Operand,
    pub points: Score,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreRule {
    pub name:    String,
    pub feature: FeatureName,
    pub tiers:   Vec<Tier>,
    /// Points contributed when the entity has no events at all.
    #[serde(default)]
    pub if_no_history: Score,
}

impl ScoreRule {
    /// Highest contribution this rule can make on either path.
    pub fn max_points(&self) -> Score {
        self.tiers.iter().map(|t| t.points).max().unwrap_or(0)
    }

    /// Index of the first tier that holds, if any.
    pub fn matching_tier(&self, features: &FeatureVector) -> Option<usize> {
        let lhs = features.value(self.feature)?;
        self.tiers.iter().position(|tier| {
            tier.value
                .resolve(features)
                .is_some_and(|rhs| tier.op.holds(lhs, rhs))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleContribution {
    pub rule:   String,
    /// Tier that fired; `None` when no tier held or history was empty.
    pub tier:   Option<usize>,
    pub points: Score,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub score:         Score,
    pub contributions: Vec<RuleContribution>,
}

/// Score a feature vector against an ordered rule list.
pub fn score(features: &FeatureVector, rules: &[ScoreRule]) -> PipelineResult<ScoreBreakdown> {
    features.validate()?;

    let contributions: Vec<RuleContribution> = rules
        .iter()
        .map(|rule| {
            if !features.has_history() {
                return RuleContribution {
                    rule:   rule.name.clone(),
                    tier:   None,
                    points: rule.if_no_history,
                };
            }
            let tier = rule.matching_tier(features);
            RuleContribution {
                rule:   rule.name.clone(),
                tier,
                points: tier.map(|i| rule.tiers[i].points).unwrap_or(0),
            }
        })
        .collect();

    // Validated rulesets stay within MAX_SCORE; hand-built rule lists saturate.
    let score = contributions.iter().fold(0, |acc: Score, c| acc.saturating_add(c.points));
    Ok(ScoreBreakdown { score, contributions })
}
