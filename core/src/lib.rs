//! riskpipe core: batch risk scoring, classification, segmentation and
//! reporting over entity event histories.

// Global invariants enforced in this crate:
// - Per-entity results depend only on that entity's own events
// - No global mutable state; configuration is passed explicitly
// - Scores are pure functions of (events, analysis time, ruleset)
// - Report ordering is deterministic

pub mod classifier;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod features;
pub mod pipeline;
pub mod report;
pub mod scoring;
pub mod segmenter;
pub mod store;
pub mod types;

pub use config::Ruleset;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{EntityResult, Pipeline, RunInput, RunOptions, RunOutput};
