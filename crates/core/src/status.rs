//! Reported rotation status and its invariants

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::StatusViolation;
use crate::kind::CredentialKind;
use crate::phase::RotationPhase;
use crate::rollout::WorkerPoolRollouts;

const INITIATION: &str = "lastInitiationTime";
const INITIATION_FINISHED: &str = "lastInitiationFinishedTime";
const COMPLETION_TRIGGERED: &str = "lastCompletionTriggeredTime";
const COMPLETION: &str = "lastCompletionTime";

/// Rotation status of one credential kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RotationStatus {
    /// Current phase
    pub phase: RotationPhase,

    /// When the current (or last) cycle was started
    pub last_initiation_time: Option<DateTime<Utc>>,

    /// When preparation finished; cleared on completion
    pub last_initiation_finished_time: Option<DateTime<Utc>>,

    /// When completion was requested; cleared on completion
    pub last_completion_triggered_time: Option<DateTime<Utc>>,

    /// When the last cycle completed
    pub last_completion_time: Option<DateTime<Utc>>,

    /// Worker pools still waiting for a node rollout
    #[serde(rename = "pendingWorkersRollouts")]
    pub pending_workers_rollouts: WorkerPoolRollouts,
}

impl RotationStatus {
    /// Status in `phase` with every timestamp unset
    #[must_use]
    pub fn new(phase: RotationPhase) -> Self {
        Self {
            phase,
            ..Self::default()
        }
    }

    /// Check that `expected` is the observed phase and its invariants hold
    pub fn check_phase(&self, expected: RotationPhase) -> Result<(), StatusViolation> {
        if self.phase != expected {
            return Err(StatusViolation::WrongPhase {
                expected,
                observed: self.phase,
            });
        }
        self.check_invariants()
    }

    /// Check the field invariants of the observed phase
    ///
    /// - preparing phases: initiation set, finished and triggered unset
    /// - `Prepared`: finished set and after initiation, triggered unset
    /// - `Completing`: finished and triggered set, triggered not before finished
    /// - `Completed`: completion after initiation, transient fields cleared
    pub fn check_invariants(&self) -> Result<(), StatusViolation> {
        let phase = self.phase;
        match phase {
            RotationPhase::NotStarted => Ok(()),
            p if p.is_preparing() => {
                require(INITIATION, self.last_initiation_time, phase)?;
                forbid(INITIATION_FINISHED, self.last_initiation_finished_time, phase)?;
                forbid(COMPLETION_TRIGGERED, self.last_completion_triggered_time, phase)
            }
            RotationPhase::Prepared => {
                let initiated = require(INITIATION, self.last_initiation_time, phase)?;
                let finished = require(INITIATION_FINISHED, self.last_initiation_finished_time, phase)?;
                after(INITIATION_FINISHED, finished, INITIATION, initiated)?;
                forbid(COMPLETION_TRIGGERED, self.last_completion_triggered_time, phase)
            }
            RotationPhase::Completing => {
                let finished = require(INITIATION_FINISHED, self.last_initiation_finished_time, phase)?;
                let triggered =
                    require(COMPLETION_TRIGGERED, self.last_completion_triggered_time, phase)?;
                not_before(COMPLETION_TRIGGERED, triggered, INITIATION_FINISHED, finished)
            }
            RotationPhase::Completed => {
                self.check_completed_after_initiation()?;
                forbid(INITIATION_FINISHED, self.last_initiation_finished_time, phase)?;
                forbid(COMPLETION_TRIGGERED, self.last_completion_triggered_time, phase)
            }
            _ => Ok(()),
        }
    }

    /// `lastCompletionTime` is set and after `lastInitiationTime`
    pub fn check_completed_after_initiation(&self) -> Result<(), StatusViolation> {
        let initiated = require(INITIATION, self.last_initiation_time, self.phase)?;
        let completed = require(COMPLETION, self.last_completion_time, self.phase)?;
        after(COMPLETION, completed, INITIATION, initiated)
    }

    /// `lastInitiationTime` lies within `window` before `now`
    pub fn check_recent_initiation(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<(), StatusViolation> {
        let initiated = require(INITIATION, self.last_initiation_time, self.phase)?;
        recent(INITIATION, initiated, now, window)
    }
}

fn require(
    field: &'static str,
    value: Option<DateTime<Utc>>,
    phase: RotationPhase,
) -> Result<DateTime<Utc>, StatusViolation> {
    value.ok_or(StatusViolation::Missing { field, phase })
}

fn forbid(
    field: &'static str,
    value: Option<DateTime<Utc>>,
    phase: RotationPhase,
) -> Result<(), StatusViolation> {
    match value {
        Some(value) => Err(StatusViolation::Unexpected {
            field,
            phase,
            value,
        }),
        None => Ok(()),
    }
}

fn after(
    later: &'static str,
    later_at: DateTime<Utc>,
    earlier: &'static str,
    earlier_at: DateTime<Utc>,
) -> Result<(), StatusViolation> {
    if later_at > earlier_at {
        Ok(())
    } else {
        Err(StatusViolation::Ordering {
            later,
            later_at,
            earlier,
            earlier_at,
            relation: "after",
        })
    }
}

fn not_before(
    later: &'static str,
    later_at: DateTime<Utc>,
    earlier: &'static str,
    earlier_at: DateTime<Utc>,
) -> Result<(), StatusViolation> {
    if later_at >= earlier_at {
        Ok(())
    } else {
        Err(StatusViolation::Ordering {
            later,
            later_at,
            earlier,
            earlier_at,
            relation: "at or after",
        })
    }
}

/// Check that `at` is no older than `window` relative to `now`
pub fn recent(
    field: &'static str,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<(), StatusViolation> {
    let age = now.signed_duration_since(at);
    // A timestamp ahead of `now` (clock skew) counts as fresh
    let fresh = age.to_std().ok().is_none_or(|age| age <= window);
    if fresh {
        Ok(())
    } else {
        Err(StatusViolation::Stale { field, at, window })
    }
}

/// Everything the driver reads from the target resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetStatus {
    /// Value of the control annotation, if still present
    pub operation: Option<String>,

    /// Last reconciliation finished successfully and the target is healthy
    pub reconciled: bool,

    /// Worker pools in the target's spec
    pub worker_pools: Vec<String>,

    /// Rotation status per kind
    pub rotations: BTreeMap<CredentialKind, RotationStatus>,
}

impl TargetStatus {
    /// Rotation status of `kind`
    pub fn rotation(&self, kind: CredentialKind) -> Result<&RotationStatus, StatusViolation> {
        self.rotations
            .get(&kind)
            .ok_or(StatusViolation::NoStatus(kind))
    }

    /// Union of the pools pending for any rollout-requiring kind
    #[must_use]
    pub fn pending_rollouts(&self) -> WorkerPoolRollouts {
        let mut pending = WorkerPoolRollouts::default();
        for (kind, status) in &self.rotations {
            if kind.requires_workers_rollout() {
                pending.extend(&status.pending_workers_rollouts);
            }
        }
        pending
    }
}
