//! Rotation phase state machine
//!
//! # Two-phase kinds
//!
//! ```text
//! NotStarted ─▶ Preparing ─────────────────────────────────────▶ Prepared ─▶ Completing ─▶ Completed
//!      │                                                            ▲
//!      └─▶ PreparingWithoutWorkersRollout ─▶ WaitingForWorkersRollout
//! ```
//!
//! `WaitingForWorkersRollout` is left only once every pending worker pool
//! was rolled out. `Completed` may start the next cycle or fall back to
//! `NotStarted`.
//!
//! # Single-phase kinds
//!
//! ```text
//! NotStarted ─▶ Preparing ─▶ Completed
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{PhaseError, PhaseResult};
use crate::kind::{CredentialKind, RotationFamily};
use crate::operation::Operation;
use crate::rollout::WorkerPoolRollouts;

/// Phase of a credential rotation as reported by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum RotationPhase {
    /// No rotation was ever started
    #[default]
    NotStarted,
    /// New material is being generated
    Preparing,
    /// New material is being generated, node rollout deferred
    PreparingWithoutWorkersRollout,
    /// Control plane prepared, worker pools still pending
    WaitingForWorkersRollout,
    /// Old and new material are both trusted
    Prepared,
    /// Old material is being retired
    Completing,
    /// Only new material is trusted
    Completed,
}

impl RotationPhase {
    /// Phases in which `lastInitiationFinishedTime` must be unset
    #[must_use]
    pub fn is_preparing(self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::PreparingWithoutWorkersRollout | Self::WaitingForWorkersRollout
        )
    }

    /// Whether a rotation cycle is running
    #[must_use]
    pub fn is_in_progress(self) -> bool {
        self.is_preparing() || matches!(self, Self::Prepared | Self::Completing)
    }

    /// Whether a new cycle may be started from this phase
    #[must_use]
    pub fn can_start(self) -> bool {
        matches!(self, Self::NotStarted | Self::Completed)
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Preparing => "Preparing",
            Self::PreparingWithoutWorkersRollout => "PreparingWithoutWorkersRollout",
            Self::WaitingForWorkersRollout => "WaitingForWorkersRollout",
            Self::Prepared => "Prepared",
            Self::Completing => "Completing",
            Self::Completed => "Completed",
        }
    }
}

impl std::fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal phase transitions of one credential kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseStateMachine {
    kind: CredentialKind,
}

impl PhaseStateMachine {
    /// State machine for `kind`
    #[must_use]
    pub fn new(kind: CredentialKind) -> Self {
        Self { kind }
    }

    /// Kind this machine describes
    #[must_use]
    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    /// Check if moving from `from` to `to` is legal. Staying put always is.
    #[must_use]
    pub fn can_transition(&self, from: RotationPhase, to: RotationPhase) -> bool {
        use RotationPhase::*;

        if from == to {
            return true;
        }

        match self.kind.family() {
            RotationFamily::TwoPhase => match (from, to) {
                (NotStarted | Completed, Preparing) => true,
                (NotStarted | Completed, PreparingWithoutWorkersRollout) => {
                    self.kind.requires_workers_rollout()
                }
                (Preparing, Prepared) => true,
                (PreparingWithoutWorkersRollout, WaitingForWorkersRollout) => true,
                (WaitingForWorkersRollout, Prepared) => true,
                (Prepared, Completing) => true,
                (Completing, Completed) => true,
                (Completed, NotStarted) => true,
                _ => false,
            },
            RotationFamily::SinglePhase => matches!(
                (from, to),
                (NotStarted | Completed, Preparing) | (Preparing, Completed) | (Completed, NotStarted)
            ),
            RotationFamily::Derived => false,
        }
    }

    /// Validate and perform a transition
    pub fn transition(&self, from: RotationPhase, to: RotationPhase) -> PhaseResult<RotationPhase> {
        if self.can_transition(from, to) {
            Ok(to)
        } else {
            Err(PhaseError::InvalidTransition {
                kind: self.kind,
                from,
                to,
            })
        }
    }

    /// Phase entered when the orchestrator accepts `operation`
    ///
    /// `Ok(None)` means the operation leaves this kind alone. Rollout
    /// operations never move the phase directly; the move to `Prepared`
    /// happens in [`PhaseStateMachine::on_reconciled`] once nothing is
    /// pending any more.
    pub fn on_operation(
        &self,
        current: RotationPhase,
        operation: &Operation,
    ) -> PhaseResult<Option<RotationPhase>> {
        let family = self.kind.family();
        if family == RotationFamily::Derived {
            return Ok(None);
        }

        let target = match operation {
            Operation::RotateCredentialsStart => RotationPhase::Preparing,
            Operation::RotateCredentialsStartWithoutWorkersRollout => {
                if self.kind.requires_workers_rollout() {
                    RotationPhase::PreparingWithoutWorkersRollout
                } else {
                    RotationPhase::Preparing
                }
            }
            Operation::RotateCredentialsComplete if family == RotationFamily::TwoPhase => {
                RotationPhase::Completing
            }
            Operation::RotateCredentialsComplete
            | Operation::RotateSshKeypair
            | Operation::RotateRolloutWorkers(_) => return Ok(None),
        };

        if operation.is_start() && !current.can_start() {
            return Err(PhaseError::NotApplicable {
                kind: self.kind,
                phase: current,
                operation: operation.to_string(),
            });
        }

        self.transition(current, target)
            .map(Some)
            .map_err(|_| PhaseError::NotApplicable {
                kind: self.kind,
                phase: current,
                operation: operation.to_string(),
            })
    }

    /// Phase reached once the orchestrator finished reconciling
    #[must_use]
    pub fn on_reconciled(
        &self,
        current: RotationPhase,
        pending: &WorkerPoolRollouts,
    ) -> RotationPhase {
        use RotationPhase::*;

        match (self.kind.family(), current) {
            (RotationFamily::TwoPhase, Preparing) => Prepared,
            (RotationFamily::TwoPhase, PreparingWithoutWorkersRollout | WaitingForWorkersRollout) => {
                if pending.is_empty() {
                    Prepared
                } else {
                    WaitingForWorkersRollout
                }
            }
            (RotationFamily::TwoPhase, Completing) => Completed,
            (RotationFamily::SinglePhase, Preparing) => Completed,
            (_, phase) => phase,
        }
    }

    /// Phase this kind must report while the run as a whole is at `run_phase`
    ///
    /// Kinds without node rollout take the ordinary path during a
    /// without-workers-rollout run. Only two-phase kinds are tracked;
    /// everything else yields `None`.
    #[must_use]
    pub fn expected_phase(&self, run_phase: RotationPhase) -> Option<RotationPhase> {
        if self.kind.family() != RotationFamily::TwoPhase {
            return None;
        }
        if self.kind.requires_workers_rollout() {
            return Some(run_phase);
        }

        Some(match run_phase {
            RotationPhase::PreparingWithoutWorkersRollout => RotationPhase::Preparing,
            RotationPhase::WaitingForWorkersRollout => RotationPhase::Prepared,
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RotationPhase::*;
    use rstest::rstest;

    fn ca() -> PhaseStateMachine {
        PhaseStateMachine::new(CredentialKind::CertificateAuthority)
    }

    #[test]
    fn two_phase_forward_transitions() {
        let sm = ca();
        assert!(sm.can_transition(NotStarted, Preparing));
        assert!(sm.can_transition(Preparing, Prepared));
        assert!(sm.can_transition(Prepared, Completing));
        assert!(sm.can_transition(Completing, Completed));
        assert!(sm.can_transition(Completed, NotStarted));
        assert!(sm.can_transition(Completed, Preparing));
    }

    #[test]
    fn without_rollout_path() {
        let sm = ca();
        assert!(sm.can_transition(NotStarted, PreparingWithoutWorkersRollout));
        assert!(sm.can_transition(PreparingWithoutWorkersRollout, WaitingForWorkersRollout));
        assert!(sm.can_transition(WaitingForWorkersRollout, Prepared));
        assert!(!sm.can_transition(PreparingWithoutWorkersRollout, Prepared));
    }

    #[rstest]
    #[case(NotStarted, Prepared)]
    #[case(Preparing, Completing)]
    #[case(Prepared, Completed)]
    #[case(Completing, Prepared)]
    fn cannot_skip_phases(#[case] from: RotationPhase, #[case] to: RotationPhase) {
        let err = ca().transition(from, to).unwrap_err();
        assert!(matches!(err, PhaseError::InvalidTransition { .. }));
    }

    #[test]
    fn encryption_key_never_waits_for_workers() {
        let sm = PhaseStateMachine::new(CredentialKind::EncryptionKey);
        assert!(!sm.can_transition(NotStarted, PreparingWithoutWorkersRollout));
        assert_eq!(
            sm.on_operation(NotStarted, &Operation::RotateCredentialsStartWithoutWorkersRollout)
                .unwrap(),
            Some(Preparing)
        );
        assert_eq!(sm.expected_phase(WaitingForWorkersRollout), Some(Prepared));
    }

    #[test]
    fn single_phase_completes_in_one_reconcile() {
        let sm = PhaseStateMachine::new(CredentialKind::Observability);
        let started = sm
            .on_operation(Completed, &Operation::RotateCredentialsStart)
            .unwrap();
        assert_eq!(started, Some(Preparing));
        assert_eq!(sm.on_reconciled(Preparing, &WorkerPoolRollouts::default()), Completed);
        assert_eq!(
            sm.on_operation(Completed, &Operation::RotateCredentialsComplete).unwrap(),
            None
        );
        assert_eq!(sm.expected_phase(Preparing), None);
    }

    #[test]
    fn complete_requires_prepared() {
        let err = ca()
            .on_operation(Preparing, &Operation::RotateCredentialsComplete)
            .unwrap_err();
        assert!(matches!(err, PhaseError::NotApplicable { phase: Preparing, .. }));
    }

    #[test]
    fn start_requires_idle_cycle() {
        let err = ca()
            .on_operation(Prepared, &Operation::RotateCredentialsStart)
            .unwrap_err();
        assert!(matches!(err, PhaseError::NotApplicable { .. }));
    }

    #[test]
    fn waiting_for_workers_leaves_only_when_nothing_pending() {
        let sm = ca();
        let mut pending = WorkerPoolRollouts::from_pools(["worker1", "worker2"]);

        assert_eq!(
            sm.on_reconciled(PreparingWithoutWorkersRollout, &pending),
            WaitingForWorkersRollout
        );

        pending.roll_out(&["worker1".to_string()].into_iter().collect());
        assert_eq!(sm.on_reconciled(WaitingForWorkersRollout, &pending), WaitingForWorkersRollout);

        pending.roll_out(&["worker2".to_string()].into_iter().collect());
        assert_eq!(sm.on_reconciled(WaitingForWorkersRollout, &pending), Prepared);
    }

    #[test]
    fn derived_kinds_ignore_operations() {
        let sm = PhaseStateMachine::new(CredentialKind::ShootAccess);
        assert_eq!(
            sm.on_operation(NotStarted, &Operation::RotateCredentialsStart).unwrap(),
            None
        );
        assert!(!sm.can_transition(NotStarted, Preparing));
    }
}
