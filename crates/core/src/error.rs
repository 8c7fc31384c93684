//! Core error types

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::kind::CredentialKind;
use crate::phase::RotationPhase;

/// Illegal use of the phase state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseError {
    /// State transition is not allowed for the kind's family
    #[error("invalid {kind} phase transition from {from} to {to}")]
    InvalidTransition {
        kind: CredentialKind,
        from: RotationPhase,
        to: RotationPhase,
    },

    /// The operation does not apply to the kind in its current phase
    #[error("operation `{operation}` does not apply to {kind} in phase {phase}")]
    NotApplicable {
        kind: CredentialKind,
        phase: RotationPhase,
        operation: String,
    },
}

/// Result type for state machine operations
pub type PhaseResult<T> = Result<T, PhaseError>;

/// A reported status that breaks the field invariants of its phase
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusViolation {
    /// Phase differs from the one expected at this point of the run
    #[error("expected phase {expected}, observed {observed}")]
    WrongPhase {
        expected: RotationPhase,
        observed: RotationPhase,
    },

    /// Field must be set in this phase
    #[error("{field} must be set in phase {phase}")]
    Missing {
        field: &'static str,
        phase: RotationPhase,
    },

    /// Field must be cleared in this phase
    #[error("{field} must be unset in phase {phase}, found {value}")]
    Unexpected {
        field: &'static str,
        phase: RotationPhase,
        value: DateTime<Utc>,
    },

    /// Two timestamps are out of order
    #[error("{later} ({later_at}) must be {relation} {earlier} ({earlier_at})")]
    Ordering {
        later: &'static str,
        later_at: DateTime<Utc>,
        earlier: &'static str,
        earlier_at: DateTime<Utc>,
        relation: &'static str,
    },

    /// Timestamp lies outside the recency window
    #[error("{field} ({at}) is older than {window:?}")]
    Stale {
        field: &'static str,
        at: DateTime<Utc>,
        window: Duration,
    },

    /// Kind is absent from the target's credentials status
    #[error("no rotation status reported for {0}")]
    NoStatus(CredentialKind),
}

/// Control annotation value that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseOperationError {
    /// Not a rotation operation
    #[error("unknown operation `{0}`")]
    Unknown(String),

    /// `rotate-rollout-workers=` without any pool
    #[error("rollout operation names no worker pool")]
    EmptyRollout,
}
