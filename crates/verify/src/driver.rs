//! Rotation run driver
//!
//! One [`RotationDriver::run`] call walks a target through a rotation:
//!
//! 1. read the status and call the `Before` hooks
//! 2. write the operation annotation and wait until the orchestrator clears it
//! 3. wait until every tracked kind reports the phase expected for the step,
//!    then call the matching hook
//! 4. repeat for the following steps of the [`RunPlan`]
//! 5. call every cleanup hook, whatever happened before
//!
//! Run-scoped state (verifier snapshots, the accumulated pending pool set,
//! the last observed status) lives in the run, never in the driver, so one
//! driver can serve several runs at once.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credrot_core::{
    CredentialKind, Operation, PhaseStateMachine, RotationPhase, TargetStatus, WorkerPoolRollouts,
};
use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::VerifyConfig;
use crate::error::{ProbeError, VerifyError, VerifyResult};
use crate::poll::{Attempt, Poller};
use crate::registry::{CleanupReport, RunState, VerifierRegistry};
use crate::verifier::{Hook, HookContext};

/// The resource whose credentials are rotated
#[async_trait]
pub trait RotationTarget: Send + Sync {
    /// Resource name, used in logs and reports
    fn name(&self) -> &str;

    /// Current annotation, reconciliation flag and rotation status
    async fn status(&self) -> Result<TargetStatus, ProbeError>;

    /// Write `operation` into the operation annotation
    async fn annotate(&self, operation: &Operation) -> Result<(), ProbeError>;

    /// Remove `pool` from the resource's worker pools
    async fn remove_worker_pool(&self, pool: &str) -> Result<(), ProbeError>;

    /// Names of the nodes currently running the resource's workers
    async fn node_identities(&self) -> Result<BTreeSet<String>, ProbeError>;
}

/// Sequence of operations a run issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPlan {
    /// `rotate-credentials-start`, then `rotate-credentials-complete`
    TwoPhase,
    /// Start without rolling out the workers, roll them out explicitly, complete
    WithoutWorkersRollout {
        /// Drop the last worker pool while the rollout is pending
        remove_last_pool: bool,
    },
    /// A single start operation that finishes within one reconciliation
    StartOnly(Operation),
}

impl std::fmt::Display for RunPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TwoPhase => f.write_str("rotate-credentials"),
            Self::WithoutWorkersRollout { .. } => {
                f.write_str("rotate-credentials-without-workers-rollout")
            }
            Self::StartOnly(operation) => write!(f, "{operation}"),
        }
    }
}

/// Something the driver did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "step", content = "value")]
pub enum Step {
    /// All verifiers passed a hook
    Hook(Hook),
    /// An operation was accepted by the orchestrator
    Operation(String),
    /// A worker pool was removed from the target
    WorkerPoolRemoved(String),
}

/// A step and when it finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    /// What happened
    pub step: Step,
    /// When it finished
    pub at: DateTime<Utc>,
}

/// Account of one run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Run identifier, also the `run_id` field of every log event
    pub run_id: Uuid,
    /// Target name
    pub target: String,
    /// Plan that was executed
    pub plan: String,
    /// Start of the run
    pub started_at: DateTime<Utc>,
    /// End of cleanup
    pub finished_at: DateTime<Utc>,
    /// Steps in execution order
    pub steps: Vec<StepRecord>,
    /// Worker pools the run rolled out explicitly
    pub rolled_out: WorkerPoolRollouts,
    /// Outcome of the cleanup hooks
    pub cleanup: CleanupReport,
}

impl RunReport {
    /// Hooks that passed, in order
    pub fn hooks(&self) -> Vec<Hook> {
        self.steps
            .iter()
            .filter_map(|record| match record.step {
                Step::Hook(hook) => Some(hook),
                _ => None,
            })
            .collect()
    }

    /// Operations that were accepted, in order
    pub fn operations(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|record| match &record.step {
                Step::Operation(operation) => Some(operation.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A run that failed, with everything it did before failing
#[derive(Debug, Error)]
#[error("rotation run {} on {} failed: {error}", .report.run_id, .report.target)]
pub struct RunFailure {
    /// First failure; cleanup failures never replace an earlier one
    #[source]
    pub error: VerifyError,
    /// Steps executed and cleanup outcome
    pub report: Box<RunReport>,
}

/// Drives rotation runs against one target
pub struct RotationDriver {
    target: Arc<dyn RotationTarget>,
    registry: VerifierRegistry,
    config: VerifyConfig,
}

impl std::fmt::Debug for RotationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationDriver")
            .field("target", &self.target.name())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl RotationDriver {
    /// Driver for `target` calling the verifiers of `registry`
    pub fn new(
        target: Arc<dyn RotationTarget>,
        registry: VerifierRegistry,
        config: VerifyConfig,
    ) -> VerifyResult<Self> {
        config.validate()?;
        Ok(Self {
            target,
            registry,
            config,
        })
    }

    /// Registered verifiers
    pub fn registry(&self) -> &VerifierRegistry {
        &self.registry
    }

    /// Execute `plan` once
    ///
    /// Cleanup hooks run on every path. The error of a failed run is the
    /// first failure observed; cleanup failures are in its report. A run
    /// whose only failure is cleanup fails with [`VerifyError::Cleanup`].
    pub async fn run(&self, plan: &RunPlan) -> Result<RunReport, RunFailure> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "rotation_run",
            %run_id,
            target = self.target.name(),
            %plan
        );
        self.run_in_span(run_id, plan).instrument(span).await
    }

    async fn run_in_span(&self, run_id: Uuid, plan: &RunPlan) -> Result<RunReport, RunFailure> {
        let started_at = Utc::now();
        tracing::info!(tracked = ?self.registry.tracked_kinds(), "Rotation run started");

        let mut run = Run {
            id: run_id,
            target: self.target.as_ref(),
            registry: &self.registry,
            config: &self.config,
            poller: self.config.poller(),
            tracked: self.registry.tracked_kinds(),
            state: self.registry.new_run(),
            status: TargetStatus::default(),
            pending: WorkerPoolRollouts::default(),
            rolled_out: WorkerPoolRollouts::default(),
            steps: Vec::new(),
        };

        let outcome = run.execute(plan).await;
        let cleanup = run.cleanup().await;

        let report = RunReport {
            run_id,
            target: self.target.name().to_string(),
            plan: plan.to_string(),
            started_at,
            finished_at: Utc::now(),
            steps: run.steps,
            rolled_out: run.rolled_out,
            cleanup,
        };

        let error = match outcome {
            Ok(()) => report.cleanup.clone().into_error(),
            Err(error) => Some(error),
        };
        match error {
            None => {
                tracing::info!(steps = report.steps.len(), "Rotation run succeeded");
                Ok(report)
            }
            Some(error) => {
                tracing::error!(error = %error, "Rotation run failed");
                Err(RunFailure {
                    error,
                    report: Box::new(report),
                })
            }
        }
    }
}

/// State of one run
struct Run<'a> {
    id: Uuid,
    target: &'a dyn RotationTarget,
    registry: &'a VerifierRegistry,
    config: &'a VerifyConfig,
    poller: Poller,
    tracked: BTreeSet<CredentialKind>,
    state: RunState,
    status: TargetStatus,
    pending: WorkerPoolRollouts,
    rolled_out: WorkerPoolRollouts,
    steps: Vec<StepRecord>,
}

impl Run<'_> {
    async fn execute(&mut self, plan: &RunPlan) -> VerifyResult<()> {
        use RotationPhase::*;

        self.status = self.read_status().await?;
        self.hook(Hook::Before).await?;

        match plan {
            RunPlan::TwoPhase => {
                self.issue(&Operation::RotateCredentialsStart).await?;
                self.reach(Some(Preparing), false, Hook::ExpectPreparingStatus)
                    .await?;
                self.reach(Some(Prepared), true, Hook::AfterPrepared).await?;
                self.complete().await
            }
            RunPlan::WithoutWorkersRollout { remove_last_pool } => {
                let pools = self.status.worker_pools.clone();
                let nodes = self.node_identities().await?;
                self.issue(&Operation::RotateCredentialsStartWithoutWorkersRollout)
                    .await?;
                self.reach(
                    Some(PreparingWithoutWorkersRollout),
                    false,
                    Hook::ExpectPreparingWithoutWorkersRolloutStatus,
                )
                .await?;
                self.reach(
                    Some(WaitingForWorkersRollout),
                    true,
                    Hook::ExpectWaitingForWorkersRolloutStatus,
                )
                .await?;
                self.expect_nodes_unchanged(&nodes).await?;
                self.expect_all_pending(&pools)?;
                if *remove_last_pool {
                    self.remove_last_pool(&pools).await?;
                }
                self.roll_out().await?;
                self.reach(Some(Prepared), true, Hook::AfterPrepared).await?;
                self.complete().await
            }
            RunPlan::StartOnly(operation) => {
                self.issue(operation).await?;
                self.hook(Hook::ExpectPreparingStatus).await?;
                self.reach(None, true, Hook::AfterPrepared).await
            }
        }
    }

    async fn complete(&mut self) -> VerifyResult<()> {
        self.issue(&Operation::RotateCredentialsComplete).await?;
        self.reach(Some(RotationPhase::Completing), false, Hook::ExpectCompletingStatus)
            .await?;
        self.reach(Some(RotationPhase::Completed), true, Hook::AfterCompleted)
            .await
    }

    async fn read_status(&self) -> VerifyResult<TargetStatus> {
        let target = self.target;
        self.poller
            .eventually("target status readable", || async move {
                Ok(target.status().await?)
            })
            .await
    }

    async fn node_identities(&self) -> VerifyResult<BTreeSet<String>> {
        let target = self.target;
        self.poller
            .eventually("node identities readable", || async move {
                Ok(target.node_identities().await?)
            })
            .await
    }

    /// No node may be replaced while the workers rollout is deferred
    async fn expect_nodes_unchanged(&self, before: &BTreeSet<String>) -> VerifyResult<()> {
        let after = self.node_identities().await?;
        if after == *before {
            tracing::debug!(nodes = after.len(), "Nodes unchanged by the deferred start");
            return Ok(());
        }
        let added: Vec<&str> = after.difference(before).map(String::as_str).collect();
        let removed: Vec<&str> = before.difference(&after).map(String::as_str).collect();
        Err(VerifyError::violation(
            "node identities",
            format!(
                "nodes replaced before the workers rollout: added [{}], removed [{}]",
                added.join(","),
                removed.join(",")
            ),
        ))
    }

    /// Write `operation` and wait until the orchestrator picked it up
    async fn issue(&mut self, operation: &Operation) -> VerifyResult<()> {
        let target = self.target;
        tracing::info!(%operation, "Issuing operation");

        self.poller
            .eventually(&format!("annotate {operation}"), || async move {
                Ok(target.annotate(operation).await?)
            })
            .await?;

        self.status = self
            .poller
            .eventually(&format!("{operation} accepted"), || async move {
                let status = target.status().await?;
                match &status.operation {
                    Some(pending) => Err(Attempt::retry(format!("annotation still set: {pending}"))),
                    None => Ok(status),
                }
            })
            .await?;

        tracing::info!(%operation, "Operation accepted");
        self.record(Step::Operation(operation.to_string()));
        Ok(())
    }

    /// Wait for `run_phase` (and reconciliation if asked), then call `hook`
    async fn reach(
        &mut self,
        run_phase: Option<RotationPhase>,
        reconciled: bool,
        hook: Hook,
    ) -> VerifyResult<()> {
        self.status = self.await_phase(run_phase, reconciled).await?;
        self.hook(hook).await
    }

    async fn await_phase(
        &self,
        run_phase: Option<RotationPhase>,
        reconciled: bool,
    ) -> VerifyResult<TargetStatus> {
        let condition = match (run_phase, reconciled) {
            (Some(phase), true) => format!("phase {phase} reconciled"),
            (Some(phase), false) => format!("phase {phase}"),
            (None, _) => "target reconciled".to_string(),
        };
        let target = self.target;
        let tracked = &self.tracked;

        self.poller
            .eventually(&condition, || async move {
                let status = target.status().await?;
                if let Some(run_phase) = run_phase {
                    let lagging = lagging_kinds(&status, tracked, run_phase)?;
                    if !lagging.is_empty() {
                        return Err(Attempt::Retry(lagging.join(", ")));
                    }
                }
                if reconciled && !status.reconciled {
                    return Err(Attempt::retry("reconciliation in progress"));
                }
                Ok(status)
            })
            .await
    }

    async fn hook(&mut self, hook: Hook) -> VerifyResult<()> {
        let cx = HookContext {
            run_id: self.id,
            hook,
            status: &self.status,
            config: self.config,
        };
        tracing::info!(%hook, "Running hook");
        self.registry.run_hook(&cx, &mut self.state).await?;
        self.record(Step::Hook(hook));
        Ok(())
    }

    /// Every pool recorded before the start must be pending for every
    /// kind that needs a node rollout
    fn expect_all_pending(&mut self, pools: &[String]) -> VerifyResult<()> {
        for (kind, rotation) in &self.status.rotations {
            if !kind.requires_workers_rollout() {
                continue;
            }
            let missing: Vec<&str> = pools
                .iter()
                .map(String::as_str)
                .filter(|pool| !rotation.pending_workers_rollouts.contains(pool))
                .collect();
            if !missing.is_empty() {
                return Err(VerifyError::violation(
                    format!("{kind} pending workers rollouts"),
                    format!(
                        "pools {} are not pending, pending: [{}]",
                        missing.join(","),
                        render(&rotation.pending_workers_rollouts)
                    ),
                ));
            }
        }
        self.pending = self.status.pending_rollouts();
        tracing::info!(pending = %render(&self.pending), "Worker pools pending rollout");
        Ok(())
    }

    /// Drop the last pool from the target and check that it is no longer
    /// pending while the others still are
    async fn remove_last_pool(&mut self, pools: &[String]) -> VerifyResult<()> {
        let [_, .., last] = pools else {
            tracing::warn!(pools = pools.len(), "Not enough worker pools to remove one");
            return Ok(());
        };
        let target = self.target;
        let pool = last.as_str();

        self.poller
            .eventually(&format!("remove worker pool {pool}"), || async move {
                Ok(target.remove_worker_pool(pool).await?)
            })
            .await?;
        self.record(Step::WorkerPoolRemoved(pool.to_string()));

        self.status = self
            .poller
            .eventually(&format!("{pool} no longer pending"), || async move {
                let status = target.status().await?;
                if !status.reconciled {
                    return Err(Attempt::retry("reconciliation in progress"));
                }
                let pending = status.pending_rollouts();
                if pending.contains(pool) {
                    return Err(Attempt::retry(format!("still pending: [{}]", render(&pending))));
                }
                Ok(status)
            })
            .await?;

        self.pending.remove_pool(pool);
        let observed = self.status.pending_rollouts();
        if observed != self.pending {
            return Err(VerifyError::violation(
                "pending workers rollouts",
                format!(
                    "expected [{}] after removing {pool}, observed [{}]",
                    render(&self.pending),
                    render(&observed)
                ),
            ));
        }
        for (kind, rotation) in &self.status.rotations {
            if kind.requires_workers_rollout()
                && rotation.phase != RotationPhase::WaitingForWorkersRollout
            {
                return Err(VerifyError::violation(
                    format!("{kind} status"),
                    format!(
                        "phase {} after removing {pool} while [{}] are still pending",
                        rotation.phase,
                        render(&self.pending)
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Roll out exactly the pools still pending
    async fn roll_out(&mut self) -> VerifyResult<()> {
        let Some(operation) = self.pending.to_operation() else {
            tracing::info!("No worker pool pending rollout");
            return Ok(());
        };
        self.issue(&operation).await?;
        self.rolled_out = std::mem::take(&mut self.pending);
        Ok(())
    }

    async fn cleanup(&mut self) -> CleanupReport {
        let cx = HookContext {
            run_id: self.id,
            hook: Hook::Cleanup,
            status: &self.status,
            config: self.config,
        };
        let report = self.registry.cleanup(&cx, &mut self.state).await;
        self.record(Step::Hook(Hook::Cleanup));
        report
    }

    fn record(&mut self, step: Step) {
        self.steps.push(StepRecord {
            step,
            at: Utc::now(),
        });
    }
}

/// Tracked kinds not yet in the phase expected at `run_phase`
///
/// A kind in the expected phase whose fields break the phase invariants
/// aborts the wait.
fn lagging_kinds(
    status: &TargetStatus,
    tracked: &BTreeSet<CredentialKind>,
    run_phase: RotationPhase,
) -> Result<Vec<String>, Attempt> {
    let mut lagging = Vec::new();
    for &kind in tracked {
        let Some(expected) = PhaseStateMachine::new(kind).expected_phase(run_phase) else {
            continue;
        };
        match status.rotations.get(&kind) {
            None => lagging.push(format!("{kind}: no status")),
            Some(rotation) if rotation.phase != expected => {
                lagging.push(format!("{kind}: {} (want {expected})", rotation.phase));
            }
            Some(rotation) => rotation
                .check_invariants()
                .map_err(|violation| Attempt::Abort(VerifyError::status(kind, &violation)))?,
        }
    }
    Ok(lagging)
}

fn render(pools: &WorkerPoolRollouts) -> String {
    pools.iter().collect::<Vec<_>>().join(",")
}
