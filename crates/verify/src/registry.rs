//! Ordered composition of verifiers
//!
//! The registry fans every hook out to its members in registration order.
//! Outcomes are gathered by an [`ErrorCollector`]: assertion hooks use it
//! fail-fast, cleanup uses it best-effort so that every member gets its
//! release attempt.

use std::any::Any;
use std::collections::BTreeSet;
use std::ops::ControlFlow;

use async_trait::async_trait;
use credrot_core::CredentialKind;
use serde::Serialize;

use crate::error::{CleanupFailure, VerifyError, VerifyResult};
use crate::verifier::{Hook, HookContext, Verifier};

type AnyState = Box<dyn Any + Send + Sync>;

/// Object-safe view of a [`Verifier`] with its state type erased
#[async_trait]
trait DynVerifier: Send + Sync {
    fn name(&self) -> &str;
    fn tracked_kind(&self) -> Option<CredentialKind>;
    fn new_state(&self) -> AnyState;
    async fn call(
        &self,
        hook: Hook,
        cx: &HookContext<'_>,
        state: &mut (dyn Any + Send + Sync),
    ) -> VerifyResult<()>;
}

#[async_trait]
impl<V: Verifier> DynVerifier for V {
    fn name(&self) -> &str {
        Verifier::name(self)
    }

    fn tracked_kind(&self) -> Option<CredentialKind> {
        Verifier::tracked_kind(self)
    }

    fn new_state(&self) -> AnyState {
        Box::new(V::State::default())
    }

    async fn call(
        &self,
        hook: Hook,
        cx: &HookContext<'_>,
        state: &mut (dyn Any + Send + Sync),
    ) -> VerifyResult<()> {
        let Some(state) = state.downcast_mut::<V::State>() else {
            return Err(VerifyError::violation(
                Verifier::name(self),
                "run state does not belong to this verifier",
            ));
        };
        match hook {
            Hook::Before => self.before(cx, state).await,
            Hook::ExpectPreparingStatus => self.expect_preparing_status(cx, state).await,
            Hook::ExpectPreparingWithoutWorkersRolloutStatus => {
                self.expect_preparing_without_workers_rollout_status(cx, state)
                    .await
            }
            Hook::ExpectWaitingForWorkersRolloutStatus => {
                self.expect_waiting_for_workers_rollout_status(cx, state)
                    .await
            }
            Hook::AfterPrepared => self.after_prepared(cx, state).await,
            Hook::ExpectCompletingStatus => self.expect_completing_status(cx, state).await,
            Hook::AfterCompleted => self.after_completed(cx, state).await,
            Hook::Cleanup => self.cleanup(cx, state).await,
        }
    }
}

/// Per-run state of every registered verifier, in registration order
pub struct RunState {
    states: Vec<AnyState>,
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState")
            .field("members", &self.states.len())
            .finish()
    }
}

/// How an [`ErrorCollector`] reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    /// Stop at the first failure
    FailFast,
    /// Record the failure and keep going
    BestEffort,
}

/// A member that failed a hook
#[derive(Debug)]
pub struct MemberFailure {
    /// Verifier name
    pub verifier: String,
    /// What it returned
    pub error: VerifyError,
}

/// Gathers member outcomes of one fan-out
#[derive(Debug)]
pub struct ErrorCollector {
    mode: CollectMode,
    succeeded: Vec<String>,
    failures: Vec<MemberFailure>,
}

impl ErrorCollector {
    /// Collector in `mode`
    pub fn new(mode: CollectMode) -> Self {
        Self {
            mode,
            succeeded: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Record one member's outcome; `Break` once the fan-out should stop
    pub fn record(&mut self, verifier: &str, outcome: VerifyResult<()>) -> ControlFlow<()> {
        match outcome {
            Ok(()) => {
                self.succeeded.push(verifier.to_string());
                ControlFlow::Continue(())
            }
            Err(error) => {
                self.failures.push(MemberFailure {
                    verifier: verifier.to_string(),
                    error,
                });
                match self.mode {
                    CollectMode::FailFast => ControlFlow::Break(()),
                    CollectMode::BestEffort => ControlFlow::Continue(()),
                }
            }
        }
    }

    /// Failures recorded so far
    pub fn failures(&self) -> &[MemberFailure] {
        &self.failures
    }

    /// First failure, attributed to its member and `hook`
    pub fn into_result(self, hook: Hook) -> VerifyResult<()> {
        match self.failures.into_iter().next() {
            None => Ok(()),
            Some(MemberFailure { verifier, error }) => Err(VerifyError::Hook {
                hook,
                verifier,
                source: Box::new(error),
            }),
        }
    }

    /// Summary of a best-effort fan-out
    pub fn into_report(self) -> CleanupReport {
        CleanupReport {
            released: self.succeeded,
            failures: self
                .failures
                .into_iter()
                .map(|MemberFailure { verifier, error }| CleanupFailure {
                    verifier,
                    error: error.to_string(),
                })
                .collect(),
        }
    }
}

/// Outcome of the cleanup fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Members whose cleanup succeeded
    pub released: Vec<String>,
    /// Members whose cleanup failed
    #[serde(serialize_with = "render_failures")]
    pub failures: Vec<CleanupFailure>,
}

fn render_failures<S: serde::Serializer>(
    failures: &[CleanupFailure],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(failures.iter().map(ToString::to_string))
}

impl CleanupReport {
    /// Every member released its resources
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures as an error, if any
    pub fn into_error(self) -> Option<VerifyError> {
        (!self.failures.is_empty()).then(|| VerifyError::Cleanup(self.failures))
    }
}

/// Ordered collection of verifiers sharing one driver loop
#[derive(Default)]
pub struct VerifierRegistry {
    members: Vec<Box<dyn DynVerifier>>,
}

impl std::fmt::Debug for VerifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl VerifierRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `verifier`; hooks run in registration order
    pub fn register<V: Verifier + 'static>(&mut self, verifier: V) -> &mut Self {
        tracing::debug!(verifier = Verifier::name(&verifier), "Verifier registered");
        self.members.push(Box::new(verifier));
        self
    }

    /// Builder-style [`VerifierRegistry::register`]
    pub fn with<V: Verifier + 'static>(mut self, verifier: V) -> Self {
        self.register(verifier);
        self
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// No member registered
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|member| member.name())
    }

    /// Kinds whose phase the driver must observe
    pub fn tracked_kinds(&self) -> BTreeSet<CredentialKind> {
        self.members
            .iter()
            .filter_map(|member| member.tracked_kind())
            .collect()
    }

    /// Fresh per-run state for every member
    pub fn new_run(&self) -> RunState {
        RunState {
            states: self.members.iter().map(|member| member.new_state()).collect(),
        }
    }

    /// Call `hook` on every member in order, stopping at the first failure
    pub async fn run_hook(&self, cx: &HookContext<'_>, run: &mut RunState) -> VerifyResult<()> {
        let collector = self.fan_out(cx, run, CollectMode::FailFast).await;
        collector.into_result(cx.hook)
    }

    /// Call every member's cleanup, whatever happens to the others
    pub async fn cleanup(&self, cx: &HookContext<'_>, run: &mut RunState) -> CleanupReport {
        let report = self
            .fan_out(cx, run, CollectMode::BestEffort)
            .await
            .into_report();
        if !report.is_clean() {
            tracing::warn!(
                run_id = %cx.run_id,
                failed = report.failures.len(),
                "Cleanup finished with failures"
            );
        }
        report
    }

    async fn fan_out(&self, cx: &HookContext<'_>, run: &mut RunState, mode: CollectMode) -> ErrorCollector {
        let mut collector = ErrorCollector::new(mode);
        for (member, state) in self.members.iter().zip(run.states.iter_mut()) {
            tracing::debug!(run_id = %cx.run_id, hook = %cx.hook, verifier = member.name(), "Calling hook");
            let outcome = member.call(cx.hook, cx, state.as_mut()).await;
            if let Err(err) = &outcome {
                tracing::warn!(
                    run_id = %cx.run_id,
                    hook = %cx.hook,
                    verifier = member.name(),
                    error = %err,
                    "Hook failed"
                );
            }
            if collector.record(member.name(), outcome).is_break() {
                break;
            }
        }
        collector
    }
}
