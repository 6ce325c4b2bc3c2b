//! The batch pipeline: intake → per-entity scoring → barrier → output.
//!
//! STAGES (fixed order):
//!   1. Intake      validate raw records, group events per entity
//!   2. Scoring     parallel map over entities: sort history, extract
//!                  features, score, classify, segment
//!   3. Barrier     collect every entity result before reporting
//!   4. Persist     optional, sequential, one transaction: score cache
//!                  + audit + run log
//!
//! RULES:
//!   - An entity's result depends only on its own events.
//!   - No shared mutable state during the parallel stage.
//!   - Bad input records are skipped and logged unless strict mode is on.
//!   - An invalid feature vector aborts the whole batch.

use crate::{
    classifier::{self, RiskCategory},
    config::Ruleset,
    entity::{self, Entity, EntityRecord, Event, EventRecord},
    error::{PipelineError, PipelineResult},
    event::{EventLogEntry, RunEvent},
    features::{self, FeatureVector},
    scoring::{self, ScoreBreakdown},
    segmenter::{self, Segment},
    store::{ScoreSnapshot, ScoreStore, ScoreWrite},
    types::{EntityId, RunId, Score},
};
use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw tabular input for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInput {
    pub entities: Vec<EntityRecord>,
    pub events:   Vec<EventRecord>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub analysis_time: NaiveDateTime,
    /// Abort on the first bad record. OR-ed with the ruleset's flag.
    pub strict:        bool,
    /// Recorded on audit rows.
    pub actor:         String,
}

impl RunOptions {
    pub fn new(analysis_time: NaiveDateTime) -> Self {
        Self {
            analysis_time,
            strict: false,
            actor:  "riskpipe".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResult {
    pub entity:    Entity,
    pub features:  FeatureVector,
    pub breakdown: ScoreBreakdown,
    pub category:  RiskCategory,
    pub segment:   Segment,
}

impl EntityResult {
    pub fn score(&self) -> Score {
        self.breakdown.score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub kind:   String,
    pub key:    String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub run_id:          RunId,
    pub ruleset:         String,
    pub ruleset_version: String,
    pub analysis_time:   NaiveDateTime,
    /// Sorted by entity id.
    pub results:         Vec<EntityResult>,
    pub rejected:        Vec<RejectedRecord>,
}

pub struct Pipeline {
    ruleset: Ruleset,
    options: RunOptions,
}

impl Pipeline {
    pub fn new(ruleset: Ruleset, options: RunOptions) -> Self {
        Self { ruleset, options }
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn strict(&self) -> bool {
        self.options.strict || self.ruleset.strict()
    }

    /// Run the batch without persistence.
    pub fn run(&self, input: &RunInput) -> PipelineResult<RunOutput> {
        let run_id = format!("run-{}", uuid::Uuid::new_v4());
        self.run_with_id(run_id, input)
    }

    fn run_with_id(&self, run_id: RunId, input: &RunInput) -> PipelineResult<RunOutput> {
        log::info!(
            "{run_id}: ruleset '{}' v{}, analysis_time={}, {} entity / {} event records",
            self.ruleset.name(),
            self.ruleset.version(),
            self.options.analysis_time,
            input.entities.len(),
            input.events.len(),
        );

        let mut rejected = Vec::new();
        let histories = self.intake(input, &mut rejected)?;
        log::debug!("{run_id}: intake complete, {} entities", histories.len());

        let results = histories
            .into_par_iter()
            .map(|(entity, mut events)| self.score_entity(entity, &mut events))
            .collect::<PipelineResult<Vec<_>>>()?;

        log::info!(
            "{run_id}: scored {} entities, rejected {} records",
            results.len(),
            rejected.len(),
        );

        Ok(RunOutput {
            run_id,
            ruleset: self.ruleset.name().to_string(),
            ruleset_version: self.ruleset.version().to_string(),
            analysis_time: self.options.analysis_time,
            results,
            rejected,
        })
    }

    /// Run the batch, then persist the run, its events and every score.
    ///
    /// Scoring finishes before anything is written, and each outcome is
    /// written in a single transaction. A failed run leaves only its
    /// `run` row with `RunStarted` and `RunFailed`; a successful one
    /// commits its scores, audit rows and events together.
    pub fn run_and_persist(&self, input: &RunInput, store: &ScoreStore) -> PipelineResult<RunOutput> {
        let run_id = format!("run-{}", uuid::Uuid::new_v4());
        let started_at = now();

        let output = match self.run_with_id(run_id.clone(), input) {
            Ok(output) => output,
            Err(err) => {
                store.in_transaction(|store| {
                    self.record_start(store, &run_id, &started_at, input)?;
                    append(store, &run_id, &RunEvent::RunFailed { reason: err.to_string() })
                })?;
                log::warn!("{run_id}: failed: {err}");
                return Err(err);
            }
        };

        let scores_written = store.in_transaction(|store| {
            self.record_start(store, &run_id, &started_at, input)?;
            self.persist_output(store, &output)
        })?;
        log::info!("{run_id}: persisted, {scores_written} score rows written");

        Ok(output)
    }

    fn record_start(
        &self,
        store: &ScoreStore,
        run_id: &str,
        started_at: &str,
        input: &RunInput,
    ) -> PipelineResult<()> {
        store.insert_run(
            run_id,
            self.ruleset.name(),
            self.ruleset.version(),
            &self.options.analysis_time.to_string(),
            &self.options.actor,
            started_at,
        )?;
        append(store, run_id, &RunEvent::RunStarted {
            run_id:          run_id.to_string(),
            ruleset:         self.ruleset.name().to_string(),
            ruleset_version: self.ruleset.version().to_string(),
            analysis_time:   self.options.analysis_time.to_string(),
            entity_records:  input.entities.len(),
            event_records:   input.events.len(),
        })
    }

    /// Rejections, score upserts and the completion event. Returns the
    /// number of score rows inserted or changed.
    fn persist_output(&self, store: &ScoreStore, output: &RunOutput) -> PipelineResult<usize> {
        let run_id = output.run_id.as_str();
        for r in &output.rejected {
            append(store, run_id, &RunEvent::RecordRejected {
                kind:   r.kind.clone(),
                key:    r.key.clone(),
                reason: r.reason.clone(),
            })?;
        }

        let recorded_at = now();
        let mut scores_written = 0;
        for result in &output.results {
            let snapshot = ScoreSnapshot {
                entity_id:       result.entity.id,
                analysis_date:   self.options.analysis_time.date(),
                ruleset_name:    self.ruleset.name().to_string(),
                ruleset_version: self.ruleset.version().to_string(),
                score:           result.score(),
                category:        result.category,
                strategy:        result.segment.strategy.clone(),
                action:          result.segment.action.clone(),
                features:        result.features.clone(),
            };
            let old_score = match store.upsert_score(run_id, &snapshot, &self.options.actor, &recorded_at)? {
                ScoreWrite::Unchanged => continue,
                ScoreWrite::Inserted => None,
                ScoreWrite::Updated { old_score } => Some(old_score),
            };
            scores_written += 1;
            if old_score.is_some() {
                append(store, run_id, &RunEvent::ScoreChanged {
                    entity_id: result.entity.id,
                    old_score,
                    new_score: result.score(),
                })?;
            }
        }

        append(store, run_id, &RunEvent::RunCompleted {
            scored:   output.results.len(),
            rejected: output.rejected.len(),
            scores_written,
        })?;
        Ok(scores_written)
    }

    /// Score one entity. `events` must all belong to `entity`.
    pub fn score_entity(&self, entity: Entity, events: &mut [Event]) -> PipelineResult<EntityResult> {
        entity::sort_events(events);

        let features = features::extract(
            entity.id,
            events,
            self.options.analysis_time,
            self.ruleset.features(),
        );
        let breakdown = scoring::score(&features, self.ruleset.scoring_rules())?;
        let category = classifier::classify(breakdown.score, self.ruleset.classification());
        let segment = segmenter::assign(category, &entity, self.ruleset.segmentation())
            .ok_or_else(|| PipelineError::InvalidRuleset {
                ruleset: self.ruleset.name().to_string(),
                reason:  format!("no segmentation rule matched entity {}", entity.id),
            })?;

        Ok(EntityResult { entity, features, breakdown, category, segment })
    }

    /// Validate records and group each entity with its events.
    fn intake(
        &self,
        input: &RunInput,
        rejected: &mut Vec<RejectedRecord>,
    ) -> PipelineResult<Vec<(Entity, Vec<Event>)>> {
        let mut entities: BTreeMap<EntityId, Entity> = BTreeMap::new();
        for (position, record) in input.entities.iter().enumerate() {
            let outcome = record.validate(position).and_then(|entity| {
                if entities.contains_key(&entity.id) {
                    return Err(PipelineError::InvalidRecord {
                        kind:   "entity",
                        key:    format!("id={}", entity.id),
                        reason: "duplicate entity id".into(),
                    });
                }
                Ok(entity)
            });
            match outcome {
                Ok(entity) => {
                    entities.insert(entity.id, entity);
                }
                Err(e) => self.reject(e, rejected)?,
            }
        }

        let mut histories: BTreeMap<EntityId, Vec<Event>> = BTreeMap::new();
        for (position, record) in input.events.iter().enumerate() {
            let outcome = record.validate(position).and_then(|event| {
                if !entities.contains_key(&event.entity_id) {
                    return Err(PipelineError::InvalidRecord {
                        kind:   "event",
                        key:    format!("entity_id={} #{position}", event.entity_id),
                        reason: "unknown entity".into(),
                    });
                }
                Ok(event)
            });
            match outcome {
                Ok(event) => histories.entry(event.entity_id).or_default().push(event),
                Err(e) => self.reject(e, rejected)?,
            }
        }

        Ok(entities
            .into_iter()
            .map(|(id, entity)| (entity, histories.remove(&id).unwrap_or_default()))
            .collect())
    }

    /// Strict mode turns a record error into a run error.
    fn reject(&self, err: PipelineError, rejected: &mut Vec<RejectedRecord>) -> PipelineResult<()> {
        if self.strict() {
            return Err(err);
        }
        match err {
            PipelineError::InvalidRecord { kind, key, reason } => {
                log::warn!("rejected {kind} record {key}: {reason}");
                rejected.push(RejectedRecord { kind: kind.to_string(), key, reason });
                Ok(())
            }
            other => Err(other),
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn append(store: &ScoreStore, run_id: &str, event: &RunEvent) -> PipelineResult<()> {
    store.append_event(&EventLogEntry {
        id:         None,
        run_id:     run_id.to_string(),
        event_type: event.type_name().to_string(),
        payload:    serde_json::to_string(event)?,
        created_at: now(),
    })
}
