//! Validation errors for supplied module data

use thiserror::Error;

/// A module handed to the replayer breaks one of its data invariants
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("pattern {pattern} has {rows} rows (expected 1-{max})")]
    PatternRows { pattern: usize, rows: u16, max: u16 },

    #[error("pattern {pattern} holds {len} notes, expected {expected}")]
    PatternData {
        pattern: usize,
        len: usize,
        expected: usize,
    },

    #[error("too many {what}: {count} (max {max})")]
    TooMany {
        what: &'static str,
        count: usize,
        max: usize,
    },

    #[error("sample {sample}: {reason}")]
    Sample { sample: usize, reason: String },

    #[error("instrument {instrument} {envelope} envelope: {reason}")]
    Envelope {
        instrument: usize,
        envelope: &'static str,
        reason: String,
    },
}
