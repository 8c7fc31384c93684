//! Per-kind verifiers
//!
//! A [`Verifier`] exposes one hook per checkpoint of a rotation run. Every
//! hook has a no-op default, so an implementation only writes the ones that
//! apply to its kind. Snapshots a verifier needs to compare across hooks
//! live in its per-run [`Verifier::State`], which the registry creates for
//! every run and hands back to each hook.

mod access;
mod encrypted;
mod material;
mod observability;

pub use access::{AccessState, AccessVerifier};
pub use encrypted::{EncryptedDataVerifier, EncryptedState};
pub use material::{DEFAULT_CERTIFICATE_AUTHORITIES, MaterialRotationVerifier, MaterialSnapshots};
pub use observability::{ObservabilityState, ObservabilityVerifier};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credrot_core::{CredentialKind, PhaseStateMachine, RotationPhase, RotationStatus, TargetStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::VerifyConfig;
use crate::error::{VerifyError, VerifyResult};
use crate::poll::Poller;

/// Checkpoint of a rotation run at which verifiers are called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hook {
    /// Before the start command
    Before,
    /// Phase `Preparing` observed
    ExpectPreparingStatus,
    /// Phase `PreparingWithoutWorkersRollout` observed
    ExpectPreparingWithoutWorkersRolloutStatus,
    /// Phase `WaitingForWorkersRollout` observed
    ExpectWaitingForWorkersRolloutStatus,
    /// Phase `Prepared` observed and reconciled
    AfterPrepared,
    /// Phase `Completing` observed
    ExpectCompletingStatus,
    /// Phase `Completed` observed and reconciled
    AfterCompleted,
    /// End of the run, on every exit path
    Cleanup,
}

impl Hook {
    /// Phase the run has reached when this hook fires
    pub fn run_phase(self) -> Option<RotationPhase> {
        match self {
            Self::Before | Self::Cleanup => None,
            Self::ExpectPreparingStatus => Some(RotationPhase::Preparing),
            Self::ExpectPreparingWithoutWorkersRolloutStatus => {
                Some(RotationPhase::PreparingWithoutWorkersRollout)
            }
            Self::ExpectWaitingForWorkersRolloutStatus => {
                Some(RotationPhase::WaitingForWorkersRollout)
            }
            Self::AfterPrepared => Some(RotationPhase::Prepared),
            Self::ExpectCompletingStatus => Some(RotationPhase::Completing),
            Self::AfterCompleted => Some(RotationPhase::Completed),
        }
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// What a hook gets to see of the run
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// Run identifier
    pub run_id: Uuid,
    /// Hook being invoked
    pub hook: Hook,
    /// Target status observed when the hook fired
    pub status: &'a TargetStatus,
    /// Run configuration
    pub config: &'a VerifyConfig,
}

impl HookContext<'_> {
    /// Poller bounded by the run configuration
    pub fn poller(&self) -> Poller {
        self.config.poller()
    }

    /// Reported status of `kind`
    pub fn rotation(&self, kind: CredentialKind) -> VerifyResult<&RotationStatus> {
        self.status
            .rotation(kind)
            .map_err(|violation| VerifyError::status(kind, &violation))
    }

    /// Status of `kind`, checked against the phase it must report at this hook
    ///
    /// Kinds that are not phase-tracked only get their field invariants
    /// checked.
    pub fn expect_phase(&self, kind: CredentialKind) -> VerifyResult<&RotationStatus> {
        let status = self.rotation(kind)?;
        let expected = self
            .hook
            .run_phase()
            .and_then(|phase| PhaseStateMachine::new(kind).expected_phase(phase));
        let checked = match expected {
            Some(phase) => status.check_phase(phase),
            None => status.check_invariants(),
        };
        checked.map_err(|violation| VerifyError::status(kind, &violation))?;
        Ok(status)
    }

    /// Check that `kind`'s rotation was initiated within the recency window
    pub fn expect_recent_initiation(&self, kind: CredentialKind) -> VerifyResult<()> {
        self.rotation(kind)?
            .check_recent_initiation(self.now(), self.config.recency_window)
            .map_err(|violation| VerifyError::status(kind, &violation))
    }

    /// Wall-clock time used for recency checks
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Checks one credential kind across a rotation run
///
/// # Example
///
/// ```rust,ignore
/// struct Announce;
///
/// #[async_trait]
/// impl Verifier for Announce {
///     type State = ();
///
///     fn name(&self) -> &str {
///         "announce"
///     }
///
///     async fn before(&self, cx: &HookContext<'_>, _state: &mut ()) -> VerifyResult<()> {
///         tracing::info!(run_id = %cx.run_id, "rotation starting");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Snapshots carried between hooks of one run
    type State: Default + Send + Sync + 'static;

    /// Name used in logs and error reports
    fn name(&self) -> &str;

    /// Kind whose phase the driver must observe before calling the hooks
    fn tracked_kind(&self) -> Option<CredentialKind> {
        None
    }

    /// Before the start command
    async fn before(&self, _cx: &HookContext<'_>, _state: &mut Self::State) -> VerifyResult<()> {
        Ok(())
    }

    /// Phase `Preparing` observed
    async fn expect_preparing_status(
        &self,
        _cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        Ok(())
    }

    /// Phase `PreparingWithoutWorkersRollout` observed
    async fn expect_preparing_without_workers_rollout_status(
        &self,
        _cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        Ok(())
    }

    /// Phase `WaitingForWorkersRollout` observed
    async fn expect_waiting_for_workers_rollout_status(
        &self,
        _cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        Ok(())
    }

    /// Phase `Prepared` observed and the target reconciled
    async fn after_prepared(
        &self,
        _cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        Ok(())
    }

    /// Phase `Completing` observed
    async fn expect_completing_status(
        &self,
        _cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        Ok(())
    }

    /// Phase `Completed` observed and the target reconciled
    async fn after_completed(
        &self,
        _cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        Ok(())
    }

    /// Release everything created during the run
    ///
    /// Called on every exit path, including after a failed hook.
    async fn cleanup(&self, _cx: &HookContext<'_>, _state: &mut Self::State) -> VerifyResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn status(kind: CredentialKind, rotation: RotationStatus) -> TargetStatus {
        TargetStatus {
            rotations: [(kind, rotation)].into_iter().collect(),
            ..TargetStatus::default()
        }
    }

    #[rstest]
    #[case(Hook::Before, None)]
    #[case(Hook::ExpectWaitingForWorkersRolloutStatus, Some(RotationPhase::WaitingForWorkersRollout))]
    #[case(Hook::AfterCompleted, Some(RotationPhase::Completed))]
    #[case(Hook::Cleanup, None)]
    fn hooks_map_to_run_phases(#[case] hook: Hook, #[case] phase: Option<RotationPhase>) {
        assert_eq!(hook.run_phase(), phase);
    }

    #[test]
    fn encryption_key_is_prepared_while_workers_wait() {
        let mut rotation = RotationStatus::new(RotationPhase::Prepared);
        rotation.last_initiation_time = Some(Utc::now() - chrono::TimeDelta::seconds(5));
        rotation.last_initiation_finished_time = Some(Utc::now());
        let target = status(CredentialKind::EncryptionKey, rotation);
        let config = VerifyConfig::default();
        let cx = HookContext {
            run_id: Uuid::new_v4(),
            hook: Hook::ExpectWaitingForWorkersRolloutStatus,
            status: &target,
            config: &config,
        };

        assert!(cx.expect_phase(CredentialKind::EncryptionKey).is_ok());
        assert!(cx.expect_recent_initiation(CredentialKind::EncryptionKey).is_ok());
    }

    #[test]
    fn missing_status_is_a_violation() {
        let target = TargetStatus::default();
        let config = VerifyConfig::default();
        let cx = HookContext {
            run_id: Uuid::new_v4(),
            hook: Hook::AfterPrepared,
            status: &target,
            config: &config,
        };
        assert!(cx.expect_phase(CredentialKind::CertificateAuthority).unwrap_err().is_violation());
    }
}
