//! Segmentation: (risk category, entity attributes) → strategy + action.
//!
//! RULE: Rules are evaluated in file order and the first match wins.
//! Order encodes priority. A general rule placed before a specific one
//! makes the specific one unreachable, which the ruleset loader rejects.

use crate::{classifier::RiskCategory, entity::Entity};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentRule {
    /// `None` matches every category.
    #[serde(default)]
    pub category: Option<RiskCategory>,
    /// Empty matches every region. Compared case-insensitively.
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub signed_up_before: Option<NaiveDate>,
    #[serde(default)]
    pub signed_up_on_or_after: Option<NaiveDate>,
    pub strategy: String,
    pub action:   String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub strategy:   String,
    pub action:     String,
    /// Position of the rule that matched.
    pub rule_index: usize,
}

fn region_in(region: &str, regions: &[String]) -> bool {
    regions.iter().any(|r| r.eq_ignore_ascii_case(region))
}

impl SegmentRule {
    pub fn is_catch_all(&self) -> bool {
        self.category.is_none()
            && self.regions.is_empty()
            && self.signed_up_before.is_none()
            && self.signed_up_on_or_after.is_none()
    }

    pub fn matches(&self, category: RiskCategory, entity: &Entity) -> bool {
        if self.category.is_some_and(|c| c != category) {
            return false;
        }
        if !self.regions.is_empty() && !region_in(&entity.region, &self.regions) {
            return false;
        }
        if let Some(before) = self.signed_up_before {
            if !entity.signup_date.is_some_and(|d| d < before) {
                return false;
            }
        }
        if let Some(after) = self.signed_up_on_or_after {
            if !entity.signup_date.is_some_and(|d| d >= after) {
                return false;
            }
        }
        true
    }

    /// True when every entity `other` matches is also matched by `self`.
    pub fn covers(&self, other: &SegmentRule) -> bool {
        let category = match (self.category, other.category) {
            (None, _)          => true,
            (Some(a), Some(b)) => a == b,
            (Some(_), None)    => false,
        };
        let regions = self.regions.is_empty()
            || (!other.regions.is_empty()
                && other.regions.iter().all(|r| region_in(r, &self.regions)));
        let before = match (self.signed_up_before, other.signed_up_before) {
            (None, _)          => true,
            (Some(a), Some(b)) => b <= a,
            (Some(_), None)    => false,
        };
        let after = match (self.signed_up_on_or_after, other.signed_up_on_or_after) {
            (None, _)          => true,
            (Some(a), Some(b)) => b >= a,
            (Some(_), None)    => false,
        };
        category && regions && before && after
    }

    /// A rule whose date window is empty can never match.
    pub fn is_satisfiable(&self) -> bool {
        match (self.signed_up_on_or_after, self.signed_up_before) {
            (Some(from), Some(until)) => from < until,
            _ => true,
        }
    }
}

/// First matching rule's (strategy, action).
pub fn assign(category: RiskCategory, entity: &Entity, rules: &[SegmentRule]) -> Option<Segment> {
    rules
        .iter()
        .enumerate()
        .find(|(_, rule)| rule.matches(category, entity))
        .map(|(rule_index, rule)| Segment {
            strategy: rule.strategy.clone(),
            action:   rule.action.clone(),
            rule_index,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(category: Option<RiskCategory>, regions: &[&str], strategy: &str) -> SegmentRule {
        SegmentRule {
            category,
            regions: regions.iter().map(|r| r.to_string()).collect(),
            signed_up_before: None,
            signed_up_on_or_after: None,
            strategy: strategy.into(),
            action: format!("{strategy} action"),
        }
    }

    fn entity(region: &str) -> Entity {
        Entity { id: 1, region: region.into(), signup_date: None }
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            rule(Some(RiskCategory::High), &["USA", "UK"], "Premium Program"),
            rule(Some(RiskCategory::High), &[], "Standard Program"),
            rule(None, &[], "Monitor Only"),
        ];

        let uk = assign(RiskCategory::High, &entity("uk"), &rules).unwrap();
        assert_eq!(uk.strategy, "Premium Program");
        assert_eq!(uk.rule_index, 0);

        let de = assign(RiskCategory::High, &entity("DE"), &rules).unwrap();
        assert_eq!(de.strategy, "Standard Program");

        let low = assign(RiskCategory::Low, &entity("UK"), &rules).unwrap();
        assert_eq!(low.strategy, "Monitor Only");
    }

    #[test]
    fn signup_window_requires_a_signup_date() {
        let mut r = rule(None, &[], "New Customer Welcome");
        r.signed_up_on_or_after = NaiveDate::from_ymd_opt(2024, 1, 1);

        assert!(!r.matches(RiskCategory::Low, &entity("USA")));

        let recent = Entity {
            id: 2,
            region: "USA".into(),
            signup_date: NaiveDate::from_ymd_opt(2024, 3, 9),
        };
        assert!(r.matches(RiskCategory::Low, &recent));
    }

    #[test]
    fn general_rule_covers_specific_rule() {
        let general = rule(Some(RiskCategory::High), &[], "Standard Program");
        let specific = rule(Some(RiskCategory::High), &["USA"], "Premium Program");

        assert!(general.covers(&specific));
        assert!(!specific.covers(&general));
        assert!(rule(None, &[], "x").covers(&general));
    }
}
