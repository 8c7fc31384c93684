//! Verification errors
//!
//! A run fails for one of two reasons: an expected external condition was
//! never observed ([`VerifyError::PollTimeout`]) or it was observed with the
//! wrong shape ([`VerifyError::InvariantViolation`]). Everything else wraps a
//! collaborator failure or a configuration mistake.

use std::time::Duration;

use credrot_core::{CredentialKind, PhaseError, StatusViolation};
use thiserror::Error;

use crate::tracker::SnapshotDiff;
use crate::verifier::Hook;

/// Failure reported by a collaborator (target, material source, probe)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Credential was refused (401/403)
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Endpoint or backend could not be reached
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Any other collaborator failure
    #[error("{0}")]
    Other(String),
}

/// One cleanup step that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// Verifier whose cleanup failed
    pub verifier: String,
    /// Rendered error
    pub error: String,
}

impl std::fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.verifier, self.error)
    }
}

/// Errors raised while driving or verifying a rotation
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Condition was not observed within its bounded window
    #[error("timed out after {timeout:?} ({attempts} attempts) waiting for {condition}; last observed: {last_observed}")]
    PollTimeout {
        condition: String,
        timeout: Duration,
        attempts: u32,
        last_observed: String,
    },

    /// Condition was observed but the data has the wrong shape
    #[error("invariant violated in {check}: {detail}")]
    InvariantViolation {
        check: String,
        detail: String,
        diff: Option<SnapshotDiff>,
    },

    /// A verifier hook failed
    #[error("{verifier} failed in {hook}: {source}")]
    Hook {
        hook: Hook,
        verifier: String,
        #[source]
        source: Box<VerifyError>,
    },

    /// Access probe or material source failed outside a polling loop
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Target resource could not be read or updated
    #[error("target {target}: {source}")]
    Target {
        target: String,
        #[source]
        source: ProbeError,
    },

    /// One or more cleanup steps failed
    #[error("{} cleanup step(s) failed: {}", .0.len(), render_failures(.0))]
    Cleanup(Vec<CleanupFailure>),

    /// Phase state machine rejected a transition
    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerifyError>;

fn render_failures(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl VerifyError {
    /// Invariant violation without a snapshot diff
    pub fn violation(check: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            check: check.into(),
            detail: detail.into(),
            diff: None,
        }
    }

    /// Invariant violation carrying the before/after diff
    pub fn violation_with_diff(
        check: impl Into<String>,
        detail: impl Into<String>,
        diff: SnapshotDiff,
    ) -> Self {
        Self::InvariantViolation {
            check: check.into(),
            detail: detail.into(),
            diff: Some(diff),
        }
    }

    /// Status of `kind` broke a field invariant
    pub fn status(kind: CredentialKind, violation: &StatusViolation) -> Self {
        Self::violation(format!("{kind} status"), violation.to_string())
    }

    /// Error with any [`VerifyError::Hook`] wrapper removed
    pub fn root(&self) -> &Self {
        match self {
            Self::Hook { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the run failed on a polling timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::PollTimeout { .. })
    }

    /// Whether the run failed on an observed invariant violation
    pub fn is_violation(&self) -> bool {
        matches!(self.root(), Self::InvariantViolation { .. })
    }

    /// Snapshot diff attached to the failure, if any
    pub fn diff(&self) -> Option<&SnapshotDiff> {
        match self.root() {
            Self::InvariantViolation { diff, .. } => diff.as_ref(),
            _ => None,
        }
    }
}
