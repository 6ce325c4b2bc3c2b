//! Shared primitive types used across the entire pipeline.

/// A stable, unique identifier for a scored entity (customer, user, product).
pub type EntityId = i64;

/// The canonical run identifier.
pub type RunId = String;

/// An additive risk score. Rulesets guarantee it never exceeds 100.
pub type Score = u32;
