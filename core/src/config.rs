//! Ruleset configuration: loading, validation and built-in defaults.
//!
//! RULE: A `Ruleset` can only be obtained through `Ruleset::compile`,
//! so every ruleset the pipeline sees has passed validation. A broken
//! ruleset stops the run before a single entity is processed.

use crate::{
    classifier::{CategoryThreshold, RiskCategory},
    error::{PipelineError, PipelineResult},
    features::FeatureName,
    scoring::{Comparison, Operand, ScoreRule, Tier},
    segmenter::SegmentRule,
    types::Score,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path};

/// Upper bound for any attainable score.
pub const MAX_SCORE: Score = 100;

/// Longest lookback a ruleset may ask for: 100 years.
pub const MAX_LOOKBACK_DAYS: i64 = 36_500;

/// Longest velocity window: 1 year.
pub const MAX_VELOCITY_WINDOW_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    /// Window for counts, rates and volatility.
    pub lookback_days:         i64,
    /// Trailing window for velocity (events per day).
    pub velocity_window_hours: i64,
    /// Amounts at or above this count as high-value events.
    pub high_value_threshold:  f64,
}

/// On-disk ruleset document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesetFile {
    pub name:           String,
    pub version:        String,
    #[serde(default)]
    pub strict:         bool,
    pub features:       FeatureConfig,
    pub scoring:        Vec<ScoreRule>,
    pub classification: Vec<CategoryThreshold>,
    pub segmentation:   Vec<SegmentRule>,
}

/// A validated ruleset.
#[derive(Debug, Clone, PartialEq)]
pub struct Ruleset {
    file: RulesetFile,
}

impl Ruleset {
    /// Load and validate a ruleset JSON file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
        let ruleset = Self::from_json_str(&content)
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
        log::debug!(
            "loaded ruleset '{}' v{} from {}",
            ruleset.name(), ruleset.version(), path.display(),
        );
        Ok(ruleset)
    }

    pub fn from_json_str(content: &str) -> PipelineResult<Self> {
        let file: RulesetFile = serde_json::from_str(content)?;
        Self::compile(file)
    }

    pub fn compile(file: RulesetFile) -> PipelineResult<Self> {
        let fail = |reason: String| PipelineError::InvalidRuleset {
            ruleset: file.name.clone(),
            reason,
        };

        if file.name.trim().is_empty() {
            return Err(fail("name is empty".into()));
        }
        if file.version.trim().is_empty() {
            return Err(fail("version is empty".into()));
        }
        validate_features(&file.features).map_err(fail)?;
        validate_scoring(&file.scoring).map_err(fail)?;
        validate_classification(&file.classification).map_err(fail)?;
        validate_segmentation(&file.segmentation, &file.classification).map_err(fail)?;

        Ok(Self { file })
    }

    pub fn name(&self) -> &str { &self.file.name }
    pub fn version(&self) -> &str { &self.file.version }
    pub fn strict(&self) -> bool { self.file.strict }
    pub fn features(&self) -> &FeatureConfig { &self.file.features }
    pub fn scoring_rules(&self) -> &[ScoreRule] { &self.file.scoring }
    pub fn classification(&self) -> &[CategoryThreshold] { &self.file.classification }
    pub fn segmentation(&self) -> &[SegmentRule] { &self.file.segmentation }
    pub fn file(&self) -> &RulesetFile { &self.file }

    /// Categories this ruleset can produce, highest first. Used to
    /// enumerate pivot columns ahead of time.
    pub fn categories(&self) -> Vec<RiskCategory> {
        self.file.classification.iter().map(|t| t.category).collect()
    }

    /// Largest score any entity can reach under this ruleset.
    pub fn max_score(&self) -> Score {
        Score::try_from(max_attainable(&self.file.scoring)).unwrap_or(Score::MAX)
    }

    /// Subscription churn defaults.
    pub fn churn_default() -> Self {
        Self { file: churn_file() }
    }

    /// Transaction fraud defaults.
    pub fn fraud_default() -> Self {
        Self { file: fraud_file() }
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Summed in u64: a handful of `u32::MAX` tiers cannot wrap.
fn max_attainable(rules: &[ScoreRule]) -> u64 {
    let with_history: u64 = rules.iter().map(|r| u64::from(r.max_points())).sum();
    let without_history: u64 = rules.iter().map(|r| u64::from(r.if_no_history)).sum();
    with_history.max(without_history)
}

fn validate_features(f: &FeatureConfig) -> Result<(), String> {
    if !(1..=MAX_LOOKBACK_DAYS).contains(&f.lookback_days) {
        return Err(format!(
            "features.lookback_days must be in 1..={MAX_LOOKBACK_DAYS}, got {}",
            f.lookback_days,
        ));
    }
    if !(1..=MAX_VELOCITY_WINDOW_HOURS).contains(&f.velocity_window_hours) {
        return Err(format!(
            "features.velocity_window_hours must be in 1..={MAX_VELOCITY_WINDOW_HOURS}, got {}",
            f.velocity_window_hours,
        ));
    }
    if !f.high_value_threshold.is_finite() || f.high_value_threshold < 0.0 {
        return Err(format!(
            "features.high_value_threshold must be finite and >= 0, got {}",
            f.high_value_threshold,
        ));
    }
    Ok(())
}

/// Whether `later` can still fire once `earlier` (same direction, both
/// constant) has failed to match.
fn tier_reachable_after(earlier: &Tier, later: &Tier) -> bool {
    let (Operand::Constant(a), Operand::Constant(b)) = (earlier.value, later.value) else {
        // Feature operands: only an exact repeat is provably dead.
        return !(earlier.op == later.op && earlier.value == later.value);
    };
    if earlier.op.is_lower_bound() {
        b < a || (a == b && earlier.op == Comparison::Gt && later.op == Comparison::Ge)
    } else {
        b > a || (a == b && earlier.op == Comparison::Lt && later.op == Comparison::Le)
    }
}

fn validate_scoring(rules: &[ScoreRule]) -> Result<(), String> {
    if rules.is_empty() {
        return Err("scoring has no rules".into());
    }

    let mut names = HashSet::new();
    for rule in rules {
        if rule.name.trim().is_empty() {
            return Err("scoring rule with empty name".into());
        }
        if !names.insert(rule.name.as_str()) {
            return Err(format!("duplicate scoring rule '{}'", rule.name));
        }
        if rule.tiers.is_empty() {
            return Err(format!("scoring rule '{}' has no tiers", rule.name));
        }

        let direction = rule.tiers[0].op.is_lower_bound();
        for (i, tier) in rule.tiers.iter().enumerate() {
            if tier.op.is_lower_bound() != direction {
                return Err(format!(
                    "scoring rule '{}' tier {i} mixes comparison directions",
                    rule.name,
                ));
            }
            if let Operand::Constant(v) = tier.value {
                if !v.is_finite() {
                    return Err(format!("scoring rule '{}' tier {i} has non-finite threshold", rule.name));
                }
            }
            if let Operand::Feature { feature } = tier.value {
                if feature == rule.feature {
                    return Err(format!(
                        "scoring rule '{}' tier {i} compares {} with itself",
                        rule.name, feature.as_str(),
                    ));
                }
            }
            for (j, earlier) in rule.tiers[..i].iter().enumerate() {
                if !tier_reachable_after(earlier, tier) {
                    return Err(format!(
                        "scoring rule '{}' tier {i} ({} {}) is unreachable after tier {j}",
                        rule.name, rule.feature.as_str(), tier.op.symbol(),
                    ));
                }
            }
        }
    }

    let max = max_attainable(rules);
    if max > u64::from(MAX_SCORE) {
        return Err(format!("maximum attainable score {max} exceeds {MAX_SCORE}"));
    }
    Ok(())
}

fn validate_classification(table: &[CategoryThreshold]) -> Result<(), String> {
    let Some(last) = table.last() else {
        return Err("classification table is empty".into());
    };
    for pair in table.windows(2) {
        let (upper, lower) = (&pair[0], &pair[1]);
        if upper.min_score <= lower.min_score {
            return Err(format!(
                "classification thresholds must strictly descend: {} ({}) before {} ({})",
                upper.category.as_str(), upper.min_score,
                lower.category.as_str(), lower.min_score,
            ));
        }
        if upper.category <= lower.category {
            return Err(format!(
                "classification categories must descend: {} listed above {}",
                upper.category.as_str(), lower.category.as_str(),
            ));
        }
    }
    if last.min_score != 0 {
        return Err(format!(
            "classification has no catch-all: last threshold is {} ({}), expected 0",
            last.category.as_str(), last.min_score,
        ));
    }
    Ok(())
}

fn validate_segmentation(
    rules: &[SegmentRule],
    classification: &[CategoryThreshold],
) -> Result<(), String> {
    let Some(last) = rules.last() else {
        return Err("segmentation has no rules".into());
    };
    if !last.is_catch_all() {
        return Err("segmentation must end with a catch-all rule (no conditions)".into());
    }

    for (i, rule) in rules.iter().enumerate() {
        if rule.strategy.trim().is_empty() || rule.action.trim().is_empty() {
            return Err(format!("segmentation rule {i} has empty strategy or action"));
        }
        if let Some(category) = rule.category {
            if !classification.iter().any(|t| t.category == category) {
                return Err(format!(
                    "segmentation rule {i} ('{}') targets category {} which the classification never produces",
                    rule.strategy, category.as_str(),
                ));
            }
        }
        if !rule.is_satisfiable() {
            return Err(format!("segmentation rule {i} ('{}') has an empty signup window", rule.strategy));
        }
        if let Some(j) = rules[..i].iter().position(|earlier| earlier.covers(rule)) {
            return Err(format!(
                "segmentation rule {i} ('{}') is unreachable: rule {j} ('{}') matches everything it does",
                rule.strategy, rules[j].strategy,
            ));
        }
    }
    Ok(())
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn tier(op: Comparison, value: f64, points: Score) -> Tier {
    Tier { op, value: Operand::Constant(value), points }
}

fn segment(category: Option<RiskCategory>, regions: &[&str], strategy: &str, action: &str) -> SegmentRule {
    SegmentRule {
        category,
        regions: regions.iter().map(|r| r.to_string()).collect(),
        signed_up_before: None,
        signed_up_on_or_after: None,
        strategy: strategy.into(),
        action: action.into(),
    }
}

fn churn_file() -> RulesetFile {
    use Comparison::*;
    use RiskCategory::*;

    RulesetFile {
        name:    "churn".into(),
        version: "1".into(),
        strict:  false,
        features: FeatureConfig {
            lookback_days:         365,
            velocity_window_hours: 24 * 30,
            high_value_threshold:  100.0,
        },
        scoring: vec![
            ScoreRule {
                name:    "cancellations_exceed_activity".into(),
                feature: FeatureName::CancelledCount,
                tiers:   vec![Tier {
                    op:     Gt,
                    value:  Operand::Feature { feature: FeatureName::ActiveCount },
                    points: 40,
                }],
                if_no_history: 0,
            },
            ScoreRule {
                name:    "low_activity_rate".into(),
                feature: FeatureName::AvgRate,
                tiers:   vec![tier(Lt, 0.3, 30), tier(Lt, 0.5, 20), tier(Lt, 0.7, 10)],
                if_no_history: 0,
            },
            ScoreRule {
                name:    "inactivity".into(),
                feature: FeatureName::RecencyDays,
                tiers:   vec![tier(Gt, 90.0, 30), tier(Gt, 60.0, 20), tier(Gt, 30.0, 10)],
                if_no_history: 0,
            },
        ],
        classification: vec![
            CategoryThreshold { category: VeryHigh, min_score: 80 },
            CategoryThreshold { category: High,     min_score: 60 },
            CategoryThreshold { category: Medium,   min_score: 40 },
            CategoryThreshold { category: Low,      min_score: 20 },
            CategoryThreshold { category: VeryLow,  min_score: 0 },
        ],
        segmentation: vec![
            segment(Some(VeryHigh), &[], "Immediate Intervention", "Personal call from account manager"),
            segment(Some(High), &["USA", "UK"], "Premium Program", "Offer premium retention discount"),
            segment(Some(High), &[], "Standard Program", "Send retention offer email"),
            segment(Some(Medium), &[], "Engagement Campaign", "Enroll in engagement newsletter"),
            segment(None, &[], "Monitor Only", "No action"),
        ],
    }
}

fn fraud_file() -> RulesetFile {
    use Comparison::*;
    use RiskCategory::*;

    RulesetFile {
        name:    "fraud".into(),
        version: "1".into(),
        strict:  false,
        features: FeatureConfig {
            lookback_days:         30,
            velocity_window_hours: 24,
            high_value_threshold:  1000.0,
        },
        scoring: vec![
            ScoreRule {
                name:    "transaction_velocity".into(),
                feature: FeatureName::Velocity,
                tiers:   vec![tier(Gt, 10.0, 40), tier(Gt, 5.0, 20)],
                if_no_history: 0,
            },
            ScoreRule {
                name:    "amount_spike".into(),
                feature: FeatureName::AmountSpikeRatio,
                tiers:   vec![tier(Ge, 5.0, 30), tier(Ge, 3.0, 15)],
                if_no_history: 0,
            },
            ScoreRule {
                name:    "high_value_transactions".into(),
                feature: FeatureName::HighValueCount,
                tiers:   vec![tier(Gt, 3.0, 20), tier(Gt, 0.0, 10)],
                if_no_history: 0,
            },
            ScoreRule {
                name:    "failed_transactions".into(),
                feature: FeatureName::CancelledCount,
                tiers:   vec![tier(Ge, 3.0, 10)],
                if_no_history: 0,
            },
        ],
        classification: vec![
            CategoryThreshold { category: VeryHigh, min_score: 70 },
            CategoryThreshold { category: High,     min_score: 40 },
            CategoryThreshold { category: Medium,   min_score: 20 },
            CategoryThreshold { category: Low,      min_score: 0 },
        ],
        segmentation: vec![
            segment(Some(VeryHigh), &[], "Block and Review", "Freeze account pending investigation"),
            segment(Some(High), &[], "Manual Review", "Queue for fraud analyst"),
            segment(Some(Medium), &[], "Step-up Verification", "Require additional authentication"),
            segment(None, &[], "Allow", "No action"),
        ],
    }
}
