//! Run lifecycle events, persisted to the store's event log.
//!
//! RULE: Events describe what happened during a run. They are written
//! after the fact and never feed back into scoring.

use crate::types::{EntityId, RunId, Score};
use serde::{Deserialize, Serialize};

/// Variants are appended, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id:          RunId,
        ruleset:         String,
        ruleset_version: String,
        analysis_time:   String,
        entity_records:  usize,
        event_records:   usize,
    },
    RecordRejected {
        kind:   String,
        key:    String,
        reason: String,
    },
    ScoreChanged {
        entity_id: EntityId,
        old_score: Option<Score>,
        new_score: Score,
    },
    RunCompleted {
        scored:         usize,
        rejected:       usize,
        scores_written: usize,
    },
    RunFailed {
        reason: String,
    },
}

impl RunEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. }     => "run_started",
            RunEvent::RecordRejected { .. } => "record_rejected",
            RunEvent::ScoreChanged { .. }   => "score_changed",
            RunEvent::RunCompleted { .. }   => "run_completed",
            RunEvent::RunFailed { .. }      => "run_failed",
        }
    }
}

/// A persisted event log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub event_type: String,
    pub payload:    String,
    pub created_at: String,
}
