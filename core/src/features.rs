//! Feature extraction: one entity's event history → FeatureVector.
//!
//! Invariants:
//!   - Pure function of (events, analysis_time, config). No clocks.
//!   - Events after `analysis_time` do not exist for this run.
//!   - Division by zero never raises: rates resolve to 0,
//!     recency resolves to `None` ("no data").

use crate::{
    config::FeatureConfig,
    entity::{Event, Status},
    error::{PipelineError, PipelineResult},
    types::EntityId,
};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub entity_id:          EntityId,
    pub total_count:        u64,
    pub active_count:       u64,
    pub cancelled_count:    u64,
    pub high_value_count:   u64,
    pub avg_rate:           f64,
    pub volatility:         f64,
    pub recency_days:       Option<i64>,
    pub velocity:           f64,
    pub total_amount:       f64,
    pub avg_amount:         f64,
    pub max_amount:         f64,
    pub amount_spike_ratio: f64,
    pub last_status:        Option<Status>,
}

/// Features a scoring rule may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureName {
    TotalCount,
    ActiveCount,
    CancelledCount,
    HighValueCount,
    AvgRate,
    Volatility,
    RecencyDays,
    Velocity,
    TotalAmount,
    AvgAmount,
    MaxAmount,
    AmountSpikeRatio,
}

impl FeatureName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TotalCount       => "total_count",
            Self::ActiveCount      => "active_count",
            Self::CancelledCount   => "cancelled_count",
            Self::HighValueCount   => "high_value_count",
            Self::AvgRate          => "avg_rate",
            Self::Volatility       => "volatility",
            Self::RecencyDays      => "recency_days",
            Self::Velocity         => "velocity",
            Self::TotalAmount      => "total_amount",
            Self::AvgAmount        => "avg_amount",
            Self::MaxAmount        => "max_amount",
            Self::AmountSpikeRatio => "amount_spike_ratio",
        }
    }
}

impl FeatureVector {
    /// Numeric value of a feature. `None` means undefined (no data).
    pub fn value(&self, feature: FeatureName) -> Option<f64> {
        match feature {
            FeatureName::TotalCount       => Some(self.total_count as f64),
            FeatureName::ActiveCount      => Some(self.active_count as f64),
            FeatureName::CancelledCount   => Some(self.cancelled_count as f64),
            FeatureName::HighValueCount   => Some(self.high_value_count as f64),
            FeatureName::AvgRate          => Some(self.avg_rate),
            FeatureName::Volatility       => Some(self.volatility),
            FeatureName::RecencyDays      => self.recency_days.map(|d| d as f64),
            FeatureName::Velocity         => Some(self.velocity),
            FeatureName::TotalAmount      => Some(self.total_amount),
            FeatureName::AvgAmount        => Some(self.avg_amount),
            FeatureName::MaxAmount        => Some(self.max_amount),
            FeatureName::AmountSpikeRatio => Some(self.amount_spike_ratio),
        }
    }

    /// True when the entity had at least one event as of the analysis time.
    pub fn has_history(&self) -> bool {
        self.recency_days.is_some()
    }

    /// Reject vectors no extraction could have produced.
    /// Values are never clamped into range.
    pub fn validate(&self) -> PipelineResult<()> {
        let invalid = |reason: String| PipelineError::InvalidFeatures {
            entity_id: self.entity_id,
            reason,
        };

        let with_status = self.active_count.checked_add(self.cancelled_count);
        if with_status.map_or(true, |n| n > self.total_count) {
            return Err(invalid(format!(
                "active_count ({}) + cancelled_count ({}) exceeds total_count ({})",
                self.active_count, self.cancelled_count, self.total_count,
            )));
        }
        if self.high_value_count > self.total_count {
            return Err(invalid(format!(
                "high_value_count ({}) exceeds total_count ({})",
                self.high_value_count, self.total_count,
            )));
        }
        if !(0.0..=1.0).contains(&self.avg_rate) {
            return Err(invalid(format!("avg_rate {} outside [0, 1]", self.avg_rate)));
        }

        let non_negative = [
            ("volatility",         self.volatility),
            ("velocity",           self.velocity),
            ("total_amount",       self.total_amount),
            ("avg_amount",         self.avg_amount),
            ("max_amount",         self.max_amount),
            ("amount_spike_ratio", self.amount_spike_ratio),
        ];
        for (name, v) in non_negative {
            if !v.is_finite() || v < 0.0 {
                return Err(invalid(format!("{name} must be finite and >= 0, got {v}")));
            }
        }

        if let Some(days) = self.recency_days {
            if days < 0 {
                return Err(invalid(format!("recency_days {days} is negative")));
            }
        }
        Ok(())
    }
}

/// Population standard deviation; 0 with fewer than two samples.
fn population_std_dev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 { numerator / denominator } else { 0.0 }
}

/// Start of a trailing window. A window reaching past the earliest
/// representable time is unbounded.
fn window_start(analysis_time: NaiveDateTime, length: Option<Duration>) -> NaiveDateTime {
    length
        .and_then(|d| analysis_time.checked_sub_signed(d))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Build the FeatureVector for one entity.
///
/// `events` should already be sorted by timestamp (see
/// `entity::sort_events`); the sort order only matters for picking
/// `last_status` between events that share a timestamp.
pub fn extract(
    entity_id: EntityId,
    events: &[Event],
    analysis_time: NaiveDateTime,
    config: &FeatureConfig,
) -> FeatureVector {
    let lookback_start = window_start(analysis_time, Duration::try_days(config.lookback_days));
    let velocity_start = window_start(analysis_time, Duration::try_hours(config.velocity_window_hours));

    let mut total_count = 0u64;
    let mut active_count = 0u64;
    let mut cancelled_count = 0u64;
    let mut high_value_count = 0u64;
    let mut velocity_count = 0u64;
    let mut series = Vec::new();
    let mut amounts = Vec::new();
    let mut latest: Option<&Event> = None;
    let mut last_status: Option<(NaiveDateTime, Status)> = None;

    for event in events.iter().filter(|e| e.timestamp <= analysis_time) {
        if latest.map_or(true, |l| event.timestamp >= l.timestamp) {
            latest = Some(event);
        }
        if let Some(status) = event.status {
            if last_status.map_or(true, |(ts, _)| event.timestamp >= ts) {
                last_status = Some((event.timestamp, status));
            }
        }

        if event.timestamp > velocity_start {
            velocity_count += 1;
        }

        if event.timestamp < lookback_start {
            continue;
        }

        total_count += 1;
        match event.status {
            Some(Status::Active)    => active_count += 1,
            Some(Status::Cancelled) => cancelled_count += 1,
            None => {}
        }

        match event.amount {
            Some(amount) => {
                if amount >= config.high_value_threshold {
                    high_value_count += 1;
                }
                amounts.push(amount);
                series.push(amount);
            }
            None => series.push(if event.status == Some(Status::Active) { 1.0 } else { 0.0 }),
        }
    }

    let total_amount: f64 = amounts.iter().sum();
    let avg_amount = ratio(total_amount, amounts.len() as f64);
    let max_amount = amounts.iter().copied().fold(0.0, f64::max);
    let window_days = config.velocity_window_hours as f64 / 24.0;

    FeatureVector {
        entity_id,
        total_count,
        active_count,
        cancelled_count,
        high_value_count,
        avg_rate: ratio(active_count as f64, total_count as f64),
        volatility: population_std_dev(&series),
        recency_days: latest.map(|e| (analysis_time - e.timestamp).num_days()),
        velocity: ratio(velocity_count as f64, window_days),
        total_amount,
        avg_amount,
        max_amount,
        amount_spike_ratio: ratio(max_amount, avg_amount),
        last_status: last_status.map(|(_, s)| s),
    }
}
