use thiserror::Error;

use crate::types::EntityId;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid feature vector for entity {entity_id}: {reason}")]
    InvalidFeatures { entity_id: EntityId, reason: String },

    #[error("Rejected {kind} record {key}: {reason}")]
    InvalidRecord {
        kind:   &'static str,
        key:    String,
        reason: String,
    },

    #[error("Invalid ruleset '{ruleset}': {reason}")]
    InvalidRuleset { ruleset: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
