//! Entity and event records: the read-only input of a run.
//!
//! RULE: Raw records arrive exactly as the source tables hold them
//! (nullable, textual timestamps). Only validated `Entity` / `Event`
//! values flow past the pipeline's intake step.

use crate::{
    error::{PipelineError, PipelineResult},
    types::EntityId,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

// ── Validated model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Active,
    Cancelled,
}

impl Status {
    /// Accepts the spellings used by subscription and transaction tables.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" | "renewed" | "completed" => Some(Self::Active),
            "cancelled" | "canceled" | "churned" | "failed" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active    => "active",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id:          EntityId,
    pub region:      String,
    pub signup_date: Option<NaiveDate>,
}

impl Entity {
    /// Signup month as `YYYY-MM`, or `unknown` without a signup date.
    pub fn cohort(&self) -> String {
        self.signup_date
            .map(|d| d.format("%Y-%m").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entity_id: EntityId,
    pub timestamp: NaiveDateTime,
    pub status:    Option<Status>,
    pub amount:    Option<f64>,
}

/// Sort one entity's history by timestamp. Stable, so input order
/// breaks ties between events sharing a timestamp.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by_key(|e| e.timestamp);
}

/// Parse a timestamp or a bare `YYYY-MM-DD` date (midnight).
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

// ── Raw records ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(default)]
    pub id:          Option<EntityId>,
    #[serde(default)]
    pub region:      Option<String>,
    #[serde(default)]
    pub signup_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub status:    Option<String>,
    #[serde(default)]
    pub amount:    Option<f64>,
}

fn rejected(kind: &'static str, key: String, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidRecord { kind, key, reason: reason.into() }
}

impl EntityRecord {
    /// `position` is the record's index in its input, used as the
    /// identifying key when the id itself is missing.
    pub fn validate(&self, position: usize) -> PipelineResult<Entity> {
        let key = match self.id {
            Some(id) => format!("id={id}"),
            None     => format!("#{position}"),
        };
        let id = self.id.ok_or_else(|| rejected("entity", key.clone(), "missing id"))?;

        let region = self.region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| rejected("entity", key.clone(), "missing region"))?
            .to_string();

        let signup_date = match self.signup_date.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                parse_timestamp(raw)
                    .map(|ts| ts.date())
                    .ok_or_else(|| rejected("entity", key.clone(), format!("unparseable signup_date '{raw}'")))?,
            ),
        };

        Ok(Entity { id, region, signup_date })
    }
}

impl EventRecord {
    pub fn validate(&self, position: usize) -> PipelineResult<Event> {
        let key = match (self.entity_id, self.timestamp.as_deref()) {
            (Some(id), Some(ts)) => format!("entity_id={id} timestamp={ts}"),
            (Some(id), None)     => format!("entity_id={id} #{position}"),
            (None, _)            => format!("#{position}"),
        };

        let entity_id = self.entity_id
            .ok_or_else(|| rejected("event", key.clone(), "missing entity_id"))?;

        let raw_ts = self.timestamp
            .as_deref()
            .ok_or_else(|| rejected("event", key.clone(), "missing timestamp"))?;
        let timestamp = parse_timestamp(raw_ts)
            .ok_or_else(|| rejected("event", key.clone(), format!("unparseable timestamp '{raw_ts}'")))?;

        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                Status::parse(raw)
                    .ok_or_else(|| rejected("event", key.clone(), format!("unknown status '{raw}'")))?,
            ),
        };

        if let Some(amount) = self.amount {
            if !amount.is_finite() || amount < 0.0 {
                return Err(rejected("event", key, format!("invalid amount {amount}")));
            }
        }

        if status.is_none() && self.amount.is_none() {
            return Err(rejected("event", key, "neither status nor amount present"));
        }

        Ok(Event { entity_id, timestamp, status, amount: self.amount })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dates_and_timestamps() {
        let midnight = parse_timestamp("2024-03-01").unwrap();
        assert_eq!(midnight.to_string(), "2024-03-01 00:00:00");

        let ts = parse_timestamp("2024-03-01T12:30:05").unwrap();
        assert_eq!(ts.to_string(), "2024-03-01 12:30:05");

        assert!(parse_timestamp("03/01/2024").is_none());
    }

    #[test]
    fn event_without_status_or_amount_is_rejected() {
        let record = EventRecord {
            entity_id: Some(7),
            timestamp: Some("2024-01-01".into()),
            ..Default::default()
        };
        let err = record.validate(0).unwrap_err();
        assert!(err.to_string().contains("entity_id=7"), "key missing from: {err}");
    }

    #[test]
    fn negative_amount_is_rejected() {
        let record = EventRecord {
            entity_id: Some(1),
            timestamp: Some("2024-01-01 10:00:00".into()),
            amount:    Some(-5.0),
            ..Default::default()
        };
        assert!(matches!(
            record.validate(3),
            Err(PipelineError::InvalidRecord { kind: "event", .. })
        ));
    }

    #[test]
    fn entity_without_id_uses_position_as_key() {
        let record = EntityRecord { region: Some("USA".into()), ..Default::default() };
        let err = record.validate(12).unwrap_err();
        assert!(err.to_string().contains("#12"));
    }

    #[test]
    fn cohort_is_signup_month() {
        let entity = EntityRecord {
            id:          Some(1),
            region:      Some(" UK ".into()),
            signup_date: Some("2023-11-17".into()),
        }
        .validate(0)
        .unwrap();
        assert_eq!(entity.region, "UK");
        assert_eq!(entity.cohort(), "2023-11");
    }
}
