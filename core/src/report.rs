//! Reporting: grouped aggregates, enumerated pivots, cohort retention
//! and text rendering.
//!
//! Global invariants enforced:
//! - Reports are strictly derived from entity results, never stored
//! - Deterministic ordering
//! - Groups with no members never appear

use crate::{
    classifier::RiskCategory,
    entity::Status,
    pipeline::{EntityResult, RunOutput},
    types::EntityId,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::Write as _,
    str::FromStr,
};

/// A grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Category,
    Region,
    Strategy,
    Action,
    Cohort,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Region   => "region",
            Self::Strategy => "strategy",
            Self::Action   => "action",
            Self::Cohort   => "cohort",
        }
    }

    pub fn key(&self, result: &EntityResult) -> String {
        match self {
            Self::Category => result.category.as_str().to_string(),
            Self::Region   => result.entity.region.clone(),
            Self::Strategy => result.segment.strategy.clone(),
            Self::Action   => result.segment.action.clone(),
            Self::Cohort   => result.entity.cohort(),
        }
    }
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "category" => Ok(Self::Category),
            "region" | "country" => Ok(Self::Region),
            "strategy" => Ok(Self::Strategy),
            "action" => Ok(Self::Action),
            "cohort" => Ok(Self::Cohort),
            other => Err(format!(
                "unknown dimension '{other}' (expected category, region, strategy, action or cohort)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub keys:              Vec<String>,
    pub count:             usize,
    pub distinct_entities: usize,
    pub avg_score:         f64,
    pub total_value:       f64,
    pub avg_value:         f64,
    /// Share of all rows, in percent.
    pub pct_of_total:      f64,
    /// Share of rows with the same first key, in percent.
    pub pct_of_parent:     f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedReport {
    pub dimensions: Vec<Dimension>,
    pub rows:       Vec<ReportRow>,
}

#[derive(Default)]
struct GroupAcc {
    count:     usize,
    entities:  BTreeSet<EntityId>,
    score_sum: u64,
    value_sum: f64,
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 * 100.0 / whole as f64 }
}

/// Group results by `dimensions` and aggregate each group.
///
/// Rows are ordered by descending average score, then ascending keys.
/// With no dimensions the whole population is one group.
pub fn group_by(results: &[EntityResult], dimensions: &[Dimension]) -> GroupedReport {
    let mut groups: BTreeMap<Vec<String>, GroupAcc> = BTreeMap::new();
    let mut parents: HashMap<String, usize> = HashMap::new();

    for result in results {
        let keys: Vec<String> = dimensions.iter().map(|d| d.key(result)).collect();
        if let Some(first) = keys.first() {
            *parents.entry(first.clone()).or_default() += 1;
        }
        let acc = groups.entry(keys).or_default();
        acc.count += 1;
        acc.entities.insert(result.entity.id);
        acc.score_sum += u64::from(result.score());
        acc.value_sum += result.features.total_amount;
    }

    let total = results.len();
    let mut rows: Vec<ReportRow> = groups
        .into_iter()
        .map(|(keys, acc)| {
            let parent = keys
                .first()
                .and_then(|k| parents.get(k).copied())
                .unwrap_or(total);
            ReportRow {
                count:             acc.count,
                distinct_entities: acc.entities.len(),
                avg_score:         acc.score_sum as f64 / acc.count as f64,
                total_value:       acc.value_sum,
                avg_value:         acc.value_sum / acc.count as f64,
                pct_of_total:      percent(acc.count, total),
                pct_of_parent:     percent(acc.count, parent),
                keys,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.avg_score
            .total_cmp(&a.avg_score)
            .then_with(|| a.keys.cmp(&b.keys))
    });

    GroupedReport {
        dimensions: dimensions.to_vec(),
        rows,
    }
}

// ── Pivot ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivotRow {
    pub key:    String,
    /// One count per pivot column, in column order.
    pub counts: Vec<usize>,
    pub total:  usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivotReport {
    pub row_dimension: Dimension,
    pub columns:       Vec<RiskCategory>,
    pub rows:          Vec<PivotRow>,
}

/// Count entities per `row_dimension` value × category.
///
/// Columns are enumerated up front (normally `Ruleset::categories`), so
/// the shape of the table is fixed by configuration rather than data.
pub fn category_pivot(
    results: &[EntityResult],
    row_dimension: Dimension,
    columns: &[RiskCategory],
) -> PivotReport {
    let mut rows: BTreeMap<String, Vec<usize>> = BTreeMap::new();

    for result in results {
        let Some(col) = columns.iter().position(|c| *c == result.category) else {
            continue;
        };
        let counts = rows
            .entry(row_dimension.key(result))
            .or_insert_with(|| vec![0; columns.len()]);
        counts[col] += 1;
    }

    PivotReport {
        row_dimension,
        columns: columns.to_vec(),
        rows: rows
            .into_iter()
            .map(|(key, counts)| PivotRow {
                total: counts.iter().sum(),
                key,
                counts,
            })
            .collect(),
    }
}

// ── Cohort retention ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRetention {
    pub cohort:         String,
    pub entities:       usize,
    pub retained:       usize,
    pub retention_rate: f64,
}

/// Per signup cohort: how many entities' latest status is still active.
pub fn cohort_retention(results: &[EntityResult]) -> Vec<CohortRetention> {
    let mut cohorts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for result in results {
        let entry = cohorts.entry(result.entity.cohort()).or_default();
        entry.0 += 1;
        if result.features.last_status == Some(Status::Active) {
            entry.1 += 1;
        }
    }

    cohorts
        .into_iter()
        .map(|(cohort, (entities, retained))| CohortRetention {
            cohort,
            entities,
            retained,
            retention_rate: percent(retained, entities),
        })
        .collect()
}

// ── Rendering ────────────────────────────────────────────────────────────────

/// Per-entity detail table: id, score, category, strategy, action.
pub fn render_detail_text(output: &RunOutput, limit: Option<usize>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>10}  {:>5}  {:<10}  {:<24}  {}",
        "entity_id", "score", "category", "strategy", "action",
    );
    let shown = limit.unwrap_or(output.results.len());
    for r in output.results.iter().take(shown) {
        let _ = writeln!(
            out,
            "{:>10}  {:>5}  {:<10}  {:<24}  {}",
            r.entity.id,
            r.score(),
            r.category.as_str(),
            r.segment.strategy,
            r.segment.action,
        );
    }
    if output.results.len() > shown {
        let _ = writeln!(out, "... {} more", output.results.len() - shown);
    }
    out
}

pub fn render_grouped_text(report: &GroupedReport) -> String {
    let mut out = String::new();
    let header: Vec<&str> = report.dimensions.iter().map(|d| d.as_str()).collect();
    let _ = writeln!(
        out,
        "{:<40}  {:>6}  {:>9}  {:>12}  {:>10}  {:>7}  {:>8}",
        if header.is_empty() { "(all)".to_string() } else { header.join(" / ") },
        "count", "avg_score", "total_value", "avg_value", "pct", "pct_grp",
    );
    for row in &report.rows {
        let label = if row.keys.is_empty() { "(all)".to_string() } else { row.keys.join(" / ") };
        let _ = writeln!(
            out,
            "{:<40}  {:>6}  {:>9.2}  {:>12.2}  {:>10.2}  {:>6.2}%  {:>7.2}%",
            label,
            row.count,
            row.avg_score,
            row.total_value,
            row.avg_value,
            row.pct_of_total,
            row.pct_of_parent,
        );
    }
    out
}

pub fn render_pivot_text(report: &PivotReport) -> String {
    let mut out = String::new();
    let _ = write!(out, "{:<24}", report.row_dimension.as_str());
    for col in &report.columns {
        let _ = write!(out, "  {:>10}", col.as_str());
    }
    let _ = writeln!(out, "  {:>7}", "total");
    for row in &report.rows {
        let _ = write!(out, "{:<24}", row.key);
        for count in &row.counts {
            let _ = write!(out, "  {:>10}", count);
        }
        let _ = writeln!(out, "  {:>7}", row.total);
    }
    out
}

pub fn render_retention_text(cohorts: &[CohortRetention]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<10}  {:>8}  {:>8}  {:>9}", "cohort", "entities", "retained", "retention");
    for c in cohorts {
        let _ = writeln!(
            out,
            "{:<10}  {:>8}  {:>8}  {:>8.2}%",
            c.cohort, c.entities, c.retained, c.retention_rate,
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_parsing() {
        assert_eq!("Category".parse::<Dimension>(), Ok(Dimension::Category));
        assert_eq!("country".parse::<Dimension>(), Ok(Dimension::Region));
        assert!("segment".parse::<Dimension>().is_err());
    }

    #[test]
    fn empty_input_has_no_groups() {
        let report = group_by(&[], &[Dimension::Category]);
        assert!(report.rows.is_empty());
        assert!(cohort_retention(&[]).is_empty());
        assert!(category_pivot(&[], Dimension::Region, &[RiskCategory::High]).rows.is_empty());
    }
}
