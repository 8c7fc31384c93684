//! credrot-core - rotation lifecycle model
//!
//! Leaf types shared by the verification engine and by anything that
//! simulates or reports on a rotation:
//!
//! - [`CredentialKind`] and its [`RotationFamily`]
//! - [`RotationPhase`] and the [`PhaseStateMachine`] of legal transitions
//! - [`RotationStatus`] with the per-phase field invariants
//! - [`Operation`], the values of the control annotation
//! - [`WorkerPoolRollouts`], the pools still waiting for a node rollout
#![forbid(unsafe_code)]

pub mod error;
pub mod kind;
pub mod operation;
pub mod phase;
pub mod rollout;
pub mod status;

pub use error::{ParseOperationError, PhaseError, PhaseResult, StatusViolation};
pub use kind::{CredentialKind, RotationFamily};
pub use operation::{OPERATION_ANNOTATION, Operation};
pub use phase::{PhaseStateMachine, RotationPhase};
pub use rollout::WorkerPoolRollouts;
pub use status::{RotationStatus, TargetStatus};
