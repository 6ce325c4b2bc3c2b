use super::ScoreStore;
use crate::{
    classifier::RiskCategory,
    error::PipelineResult,
    features::FeatureVector,
    types::{EntityId, Score},
};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Everything persisted for one entity under one cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub entity_id:       EntityId,
    pub analysis_date:   NaiveDate,
    pub ruleset_name:    String,
    pub ruleset_version: String,
    pub score:           Score,
    pub category:        RiskCategory,
    pub strategy:        String,
    pub action:          String,
    pub features:        FeatureVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreWrite {
    Inserted,
    /// Identical recomputation; nothing written.
    Unchanged,
    Updated { old_score: Score },
}

impl ScoreStore {
    // ── Score cache ────────────────────────────────────────────

    pub fn cached_score(
        &self,
        entity_id: EntityId,
        analysis_date: NaiveDate,
        ruleset_name: &str,
        ruleset_version: &str,
    ) -> PipelineResult<Option<ScoreSnapshot>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT snapshot FROM entity_score
                 WHERE entity_id = ?1 AND analysis_date = ?2
                   AND ruleset_name = ?3 AND ruleset_version = ?4",
                params![entity_id, analysis_date.to_string(), ruleset_name, ruleset_version],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Idempotent write keyed by (entity, analysis date, ruleset name,
    /// ruleset version).
    /// Every insert or change appends one audit row; an identical
    /// recomputation writes nothing.
    pub fn upsert_score(
        &self,
        run_id: &str,
        snapshot: &ScoreSnapshot,
        actor: &str,
        recorded_at: &str,
    ) -> PipelineResult<ScoreWrite> {
        let date = snapshot.analysis_date.to_string();
        let new_json = serde_json::to_string(snapshot)?;

        let existing: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT snapshot, score FROM entity_score
                 WHERE entity_id = ?1 AND analysis_date = ?2
                   AND ruleset_name = ?3 AND ruleset_version = ?4",
                params![snapshot.entity_id, date, snapshot.ruleset_name, snapshot.ruleset_version],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((old_json, _)) = &existing {
            if *old_json == new_json {
                return Ok(ScoreWrite::Unchanged);
            }
        }

        self.conn.execute(
            "INSERT INTO entity_score (
                entity_id, analysis_date, ruleset_name, ruleset_version, score,
                category, strategy, action, snapshot, run_id, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(entity_id, analysis_date, ruleset_name, ruleset_version) DO UPDATE SET
                score      = excluded.score,
                category   = excluded.category,
                strategy   = excluded.strategy,
                action     = excluded.action,
                snapshot   = excluded.snapshot,
                run_id     = excluded.run_id,
                updated_at = excluded.updated_at",
            params![
                snapshot.entity_id,
                date,
                snapshot.ruleset_name,
                snapshot.ruleset_version,
                snapshot.score as i64,
                snapshot.category.as_str(),
                snapshot.strategy,
                snapshot.action,
                new_json,
                run_id,
                recorded_at,
            ],
        )?;

        self.conn.execute(
            "INSERT INTO score_audit (
                entity_id, analysis_date, ruleset_name, ruleset_version,
                old_snapshot, new_snapshot, actor, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.entity_id,
                date,
                snapshot.ruleset_name,
                snapshot.ruleset_version,
                existing.as_ref().map(|(json, _)| json.as_str()),
                new_json,
                actor,
                recorded_at,
            ],
        )?;

        Ok(match existing {
            Some((_, old_score)) => ScoreWrite::Updated { old_score: old_score as Score },
            None => ScoreWrite::Inserted,
        })
    }

    pub fn score_count(&self) -> PipelineResult<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM entity_score", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn audit_count(&self, entity_id: EntityId) -> PipelineResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM score_audit WHERE entity_id = ?1",
            params![entity_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
