//! credrot-verify - credential rotation verification engine
//!
//! Drives a target through a multi-phase credential rotation and checks,
//! at every checkpoint, that the reported status and the observable
//! credential material behave as a rotation must.
//!
//! # Pieces
//!
//! - **[`RotationDriver`]** - issues the control operations of a [`RunPlan`],
//!   waits for each phase and calls the verifier hooks
//! - **[`VerifierRegistry`]** - fans each hook out to the registered
//!   [`Verifier`]s and holds their per-run state
//! - **[`SecretLifecycleTracker`]** - settled snapshots of rotated material
//!   and the count and retention laws between them
//! - **Probes** - [`AccessProbe`], [`ProtectedStore`] and
//!   [`ObservabilityProbe`] prove that issued credentials and encrypted data
//!   still work
//!
//! ```rust,ignore
//! let registry = VerifierRegistry::new()
//!     .with(MaterialRotationVerifier::certificate_authorities(domain, tracker, ["ca"]))
//!     .with(AccessVerifier::shoot(probe));
//! let driver = RotationDriver::new(target, registry, VerifyConfig::from_env()?)?;
//! let report = driver.run(&RunPlan::TwoPhase).await?;
//! ```
#![forbid(unsafe_code)]

/// Timeouts, intervals and windows
pub mod config;
/// Run driver and rotation target surface
pub mod driver;
/// Error types
pub mod error;
/// Bounded polling
pub mod poll;
/// Credential and data probes
pub mod probe;
/// Verifier fan-out and per-run state
pub mod registry;
/// Material snapshots and checkpoint laws
pub mod tracker;
pub mod verifier;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// ── Root re-exports ─────────────────────────────────────────────────────────

pub use credrot_core;

pub use config::{PollConfig, VerifyConfig};
pub use driver::{RotationDriver, RotationTarget, RunFailure, RunPlan, RunReport, Step, StepRecord};
pub use error::{CleanupFailure, ProbeError, VerifyError, VerifyResult};
pub use poll::{Attempt, Poller};
pub use probe::{
    AccessClient, AccessCredential, AccessMethod, AccessProbe, BasicAuth, EncryptedResource,
    ObjectRef, ObservabilityProbe, ProtectedClient, ProtectedObject, ProtectedStore,
};
pub use registry::{CleanupReport, CollectMode, ErrorCollector, VerifierRegistry};
pub use tracker::{
    Checkpoint, Material, MaterialDomain, MaterialNames, MaterialSource, SecretGroup,
    SecretLifecycleTracker, SnapshotDiff,
};
pub use verifier::{
    AccessVerifier, DEFAULT_CERTIFICATE_AUTHORITIES, EncryptedDataVerifier, Hook, HookContext,
    MaterialRotationVerifier, ObservabilityVerifier, Verifier,
};
