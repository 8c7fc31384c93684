//! In-memory orchestrator for tests
//!
//! [`FakeGarden`] plays the external system: it picks up operation
//! annotations, advances rotation phases after a configurable number of
//! status reads, generates and retires material, and decides which minted
//! credentials and stored objects are still trusted. [`Faults`] make it
//! misbehave in specific ways.
//!
//! ```rust,ignore
//! let garden = FakeGarden::builder("local")
//!     .worker_pools(["worker1", "worker2"])
//!     .material(domain.clone(), MaterialNames::with_bundle("ca"))
//!     .build();
//! let target: Arc<dyn RotationTarget> = Arc::new(garden.clone());
//! ```

mod probes;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use credrot_core::{
    CredentialKind, Operation, PhaseStateMachine, RotationFamily, RotationPhase, RotationStatus,
    TargetStatus,
};
use parking_lot::Mutex;

use crate::driver::RotationTarget;
use crate::error::ProbeError;
use crate::probe::AccessMethod;
use crate::tracker::{Material, MaterialDomain, MaterialNames, MaterialSource, NAME_LABEL};

/// Ways the fake orchestrator can misbehave
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Never pick up operation annotations
    pub ignore_operations: bool,
    /// Keep the old primary material when completing
    pub keep_old_primary: bool,
    /// Report an initiation time from long ago
    pub stale_initiation: bool,
    /// Fail this many status reads before answering
    pub unavailable_reads: u32,
    /// Keep a removed worker pool pending
    pub keep_removed_pool_pending: bool,
    /// Retire the old encryption key without re-encrypting stored data
    pub skip_reencryption: bool,
    /// Refuse to release minted credentials
    pub fail_release: bool,
    /// Clear `lastInitiationFinishedTime` when completion starts
    pub drop_finished_time: bool,
    /// Keep trusting certificates and tokens issued before completion
    pub keep_old_trust: bool,
    /// Keep accepting the observability password from before its rotation
    pub keep_old_password: bool,
    /// Replace the nodes while the workers rollout is still deferred
    pub roll_nodes_early: bool,
    /// Refuse protected-store connections after this many
    pub refuse_connects_after: Option<u32>,
}

#[derive(Debug, Clone)]
struct Trust {
    newest: u32,
    trusted: BTreeSet<u32>,
}

impl Default for Trust {
    fn default() -> Self {
        Self {
            newest: 0,
            trusted: BTreeSet::from([0]),
        }
    }
}

#[derive(Debug)]
struct Minted {
    method: AccessMethod,
    generation: u32,
}

#[derive(Debug)]
struct Stored {
    resource: String,
    data: Vec<u8>,
    generation: u32,
}

#[derive(Debug)]
struct Garden {
    annotation: Option<String>,
    reconcile_in: Option<u32>,
    reconcile_reads: u32,
    reconciled: bool,
    worker_pools: Vec<String>,
    nodes: BTreeMap<String, String>,
    rotations: BTreeMap<CredentialKind, RotationStatus>,
    managed: Vec<(MaterialDomain, MaterialNames)>,
    materials: Vec<(String, Material)>,
    trust: BTreeMap<CredentialKind, Trust>,
    password_generation: u32,
    minted: Vec<Minted>,
    released: Vec<AccessMethod>,
    objects: BTreeMap<String, Stored>,
    connects: u32,
    accepted: Vec<String>,
    serial: u64,
    clock: DateTime<Utc>,
    faults: Faults,
}

/// Handle to a shared in-memory orchestrator
///
/// Clones share the same state, so one garden can be handed out as target,
/// material source and probe at once.
#[derive(Debug, Clone)]
pub struct FakeGarden {
    name: Arc<str>,
    inner: Arc<Mutex<Garden>>,
}

/// Builder for [`FakeGarden`]
#[derive(Debug)]
pub struct FakeGardenBuilder {
    name: String,
    worker_pools: Vec<String>,
    kinds: BTreeSet<CredentialKind>,
    managed: Vec<(MaterialDomain, MaterialNames)>,
    reconcile_reads: u32,
    faults: Faults,
}

impl FakeGardenBuilder {
    /// Worker pools of the target
    pub fn worker_pools<I, S>(mut self, pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_pools = pools.into_iter().map(Into::into).collect();
        self
    }

    /// Report a rotation status for `kind`
    pub fn rotating(mut self, kind: CredentialKind) -> Self {
        if kind.has_status() {
            self.kinds.insert(kind);
        }
        self
    }

    /// Manage `names` in `domain`; also reports `domain.kind`
    pub fn material(mut self, domain: MaterialDomain, names: MaterialNames) -> Self {
        self = self.rotating(domain.kind);
        self.managed.push((domain, names));
        self
    }

    /// Status reads a reconciliation takes to finish (at least 2)
    pub fn reconcile_reads(mut self, reads: u32) -> Self {
        self.reconcile_reads = reads.max(2);
        self
    }

    /// Misbehave as described by `faults`
    pub fn faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Build the garden with one generation of every managed material
    pub fn build(self) -> FakeGarden {
        let mut garden = Garden {
            annotation: None,
            reconcile_in: None,
            reconcile_reads: self.reconcile_reads,
            reconciled: true,
            worker_pools: self.worker_pools,
            nodes: BTreeMap::new(),
            rotations: self
                .kinds
                .iter()
                .map(|&kind| (kind, RotationStatus::new(RotationPhase::NotStarted)))
                .collect(),
            managed: self.managed,
            materials: Vec::new(),
            trust: BTreeMap::new(),
            password_generation: 0,
            minted: Vec::new(),
            released: Vec::new(),
            objects: BTreeMap::new(),
            connects: 0,
            accepted: Vec::new(),
            serial: 0,
            clock: Utc::now() - TimeDelta::hours(1),
            faults: self.faults,
        };

        for index in 0..garden.managed.len() {
            garden.generate(index);
        }
        let pools = garden.worker_pools.clone();
        garden.replace_nodes(pools);

        FakeGarden {
            name: self.name.into(),
            inner: Arc::new(Mutex::new(garden)),
        }
    }
}

impl FakeGarden {
    /// Builder for a garden called `name`
    pub fn builder(name: impl Into<String>) -> FakeGardenBuilder {
        FakeGardenBuilder {
            name: name.into(),
            worker_pools: Vec::new(),
            kinds: BTreeSet::new(),
            managed: Vec::new(),
            reconcile_reads: 3,
            faults: Faults::default(),
        }
    }

    /// Change the faults of a running garden
    pub fn set_faults(&self, faults: Faults) {
        self.inner.lock().faults = faults;
    }

    /// Current rotation status of `kind`
    pub fn rotation(&self, kind: CredentialKind) -> Option<RotationStatus> {
        self.inner.lock().rotations.get(&kind).cloned()
    }

    /// Operations the garden accepted, in order
    pub fn accepted_operations(&self) -> Vec<String> {
        self.inner.lock().accepted.clone()
    }

    /// Worker pools currently in the spec
    pub fn worker_pools(&self) -> Vec<String> {
        self.inner.lock().worker_pools.clone()
    }

    /// Access methods whose objects were released
    pub fn released_access(&self) -> Vec<AccessMethod> {
        self.inner.lock().released.clone()
    }

    /// Number of objects in protected storage
    pub fn stored_objects(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Current node of every worker pool
    pub fn nodes(&self) -> BTreeMap<String, String> {
        self.inner.lock().nodes.clone()
    }

    /// Names of the material currently listed under `domain`
    pub fn material_names(&self, domain: &MaterialDomain) -> Vec<String> {
        self.inner
            .lock()
            .list(domain)
            .into_iter()
            .map(|material| material.name)
            .collect()
    }
}

impl Garden {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.clock = if now > self.clock {
            now
        } else {
            self.clock + TimeDelta::milliseconds(1)
        };
        self.clock
    }

    fn next_suffix(&mut self) -> String {
        self.serial += 1;
        format!("g{:06}", self.serial)
    }

    fn trust(&self, kind: CredentialKind) -> Trust {
        self.trust.get(&kind).cloned().unwrap_or_default()
    }

    fn list(&self, domain: &MaterialDomain) -> Vec<Material> {
        self.materials
            .iter()
            .filter(|(namespace, material)| {
                *namespace == domain.namespace && domain.matches(material)
            })
            .map(|(_, material)| material.clone())
            .collect()
    }

    fn new_material(&mut self, domain: &MaterialDomain, logical: &str) {
        let created_at = self.tick();
        let suffix = self.next_suffix();
        let mut material = Material::new(format!("{logical}-{suffix}"), created_at)
            .with_label(NAME_LABEL, logical);
        for (key, value) in &domain.selector {
            material = material.with_label(key.clone(), value.clone());
        }
        self.materials.push((domain.namespace.clone(), material));
    }

    fn drop_material(&mut self, domain: &MaterialDomain, logical: &str, keep_newest: bool) {
        let mut owned: Vec<(usize, DateTime<Utc>)> = self
            .materials
            .iter()
            .enumerate()
            .filter(|(_, (namespace, material))| {
                *namespace == domain.namespace
                    && domain.matches(material)
                    && material.logical_name() == logical
            })
            .map(|(index, (_, material))| (index, material.created_at))
            .collect();
        owned.sort_by_key(|(index, created_at)| (*created_at, *index));
        if keep_newest {
            owned.pop();
        }
        let doomed: BTreeSet<usize> = owned.into_iter().map(|(index, _)| index).collect();
        let mut index = 0;
        self.materials.retain(|_| {
            let keep = !doomed.contains(&index);
            index += 1;
            keep
        });
    }

    /// Add a new primary and replace the bundle of managed entry `index`
    fn generate(&mut self, index: usize) {
        let (domain, names) = self.managed[index].clone();
        self.new_material(&domain, &names.primary);
        if let Some(bundle) = &names.bundle {
            self.drop_material(&domain, bundle, false);
            self.new_material(&domain, bundle);
        }
    }

    /// Drop old primaries and replace the bundle of managed entry `index`
    fn retire(&mut self, index: usize) {
        let (domain, names) = self.managed[index].clone();
        if !self.faults.keep_old_primary {
            self.drop_material(&domain, &names.primary, true);
        }
        if let Some(bundle) = &names.bundle {
            self.drop_material(&domain, bundle, false);
            self.new_material(&domain, bundle);
        }
    }

    /// Put a fresh node into each of `pools` that still exists
    fn replace_nodes(&mut self, pools: impl IntoIterator<Item = String>) {
        for pool in pools {
            if self.worker_pools.contains(&pool) {
                let node = format!("machine-{pool}-{}", self.next_suffix());
                self.nodes.insert(pool, node);
            }
        }
    }

    fn managed_indices(&self, kind: CredentialKind) -> Vec<usize> {
        self.managed
            .iter()
            .enumerate()
            .filter(|(_, (domain, _))| domain.kind == kind)
            .map(|(index, _)| index)
            .collect()
    }

    fn start_reconcile(&mut self) {
        self.reconciled = false;
        self.reconcile_in = Some(self.reconcile_reads);
    }

    fn read_status(&mut self) -> Result<TargetStatus, ProbeError> {
        if self.faults.unavailable_reads > 0 {
            self.faults.unavailable_reads -= 1;
            return Err(ProbeError::Unavailable("garden API not reachable".into()));
        }

        if let Some(annotation) = self.annotation.clone() {
            if !self.faults.ignore_operations {
                self.annotation = None;
                self.accept(&annotation);
            }
        } else if let Some(reads) = self.reconcile_in {
            if reads <= 1 {
                self.reconcile_in = None;
                self.finish_reconcile();
            } else {
                self.reconcile_in = Some(reads - 1);
            }
        }

        Ok(TargetStatus {
            operation: self.annotation.clone(),
            reconciled: self.reconciled,
            worker_pools: self.worker_pools.clone(),
            rotations: self.rotations.clone(),
        })
    }

    fn accept(&mut self, annotation: &str) {
        let Ok(operation) = annotation.parse::<Operation>() else {
            tracing::debug!(annotation, "Ignoring unknown operation");
            return;
        };
        self.accepted.push(annotation.to_string());
        let now = self.tick();
        let pools = self.worker_pools.clone();
        let faults = self.faults.clone();

        for (&kind, status) in &mut self.rotations {
            if let Operation::RotateRolloutWorkers(requested) = &operation {
                if kind.requires_workers_rollout()
                    && status.phase == RotationPhase::WaitingForWorkersRollout
                {
                    status.pending_workers_rollouts.roll_out(requested);
                }
                continue;
            }

            let next = match PhaseStateMachine::new(kind).on_operation(status.phase, &operation) {
                Ok(Some(next)) => next,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!(%kind, error = %err, "Operation rejected");
                    continue;
                }
            };

            match next {
                RotationPhase::Preparing | RotationPhase::PreparingWithoutWorkersRollout => {
                    status.last_initiation_time = Some(if faults.stale_initiation {
                        now - TimeDelta::hours(1)
                    } else {
                        now
                    });
                    status.last_initiation_finished_time = None;
                    status.last_completion_triggered_time = None;
                    if next == RotationPhase::PreparingWithoutWorkersRollout {
                        status.pending_workers_rollouts =
                            pools.iter().cloned().collect();
                    }
                }
                RotationPhase::Completing => {
                    status.last_completion_triggered_time = Some(now);
                    if faults.drop_finished_time {
                        status.last_initiation_finished_time = None;
                    }
                }
                _ => {}
            }
            status.phase = next;
        }

        if let Operation::RotateRolloutWorkers(requested) = operation {
            self.replace_nodes(requested);
        }
        self.start_reconcile();
    }

    fn finish_reconcile(&mut self) {
        let now = self.tick();
        let mut generated = Vec::new();
        let mut retired = Vec::new();
        let mut password_rotated = false;
        let mut nodes_rolled = false;

        for (&kind, status) in &mut self.rotations {
            let from = status.phase;
            let to = PhaseStateMachine::new(kind).on_reconciled(from, &status.pending_workers_rollouts);
            if to == from {
                continue;
            }

            if kind.requires_workers_rollout() {
                nodes_rolled |= from == RotationPhase::Preparing
                    || (from == RotationPhase::PreparingWithoutWorkersRollout
                        && self.faults.roll_nodes_early);
            }

            match kind.family() {
                RotationFamily::TwoPhase => {
                    if matches!(
                        from,
                        RotationPhase::Preparing | RotationPhase::PreparingWithoutWorkersRollout
                    ) {
                        generated.push(kind);
                    }
                    if to == RotationPhase::Prepared {
                        status.last_initiation_finished_time = Some(now);
                    }
                    if to == RotationPhase::Completed {
                        status.last_completion_time = Some(now);
                        status.last_initiation_finished_time = None;
                        status.last_completion_triggered_time = None;
                        retired.push(kind);
                    }
                }
                RotationFamily::SinglePhase => {
                    status.last_completion_time = Some(now);
                    password_rotated |= kind == CredentialKind::Observability;
                }
                RotationFamily::Derived => {}
            }
            tracing::debug!(%kind, %from, %to, "Rotation phase advanced");
            status.phase = to;
        }

        for kind in generated {
            for index in self.managed_indices(kind) {
                self.generate(index);
            }
            let trust = self.trust.entry(kind).or_default();
            trust.newest += 1;
            trust.trusted.insert(trust.newest);
        }
        for kind in retired {
            for index in self.managed_indices(kind) {
                self.retire(index);
            }
            let keep_old = self.faults.keep_old_trust
                && matches!(
                    kind,
                    CredentialKind::CertificateAuthority | CredentialKind::ServiceAccountKey
                );
            let trust = self.trust.entry(kind).or_default();
            if !keep_old {
                trust.trusted = BTreeSet::from([trust.newest]);
            }
            if kind == CredentialKind::EncryptionKey && !self.faults.skip_reencryption {
                let newest = trust.newest;
                for object in self.objects.values_mut() {
                    object.generation = newest;
                }
            }
        }
        if password_rotated {
            self.password_generation += 1;
        }
        if nodes_rolled {
            let pools = self.worker_pools.clone();
            self.replace_nodes(pools);
        }

        self.reconciled = true;
    }

    fn remove_worker_pool(&mut self, pool: &str) -> Result<(), ProbeError> {
        let before = self.worker_pools.len();
        self.worker_pools.retain(|existing| existing != pool);
        if self.worker_pools.len() == before {
            return Err(ProbeError::NotFound(format!("worker pool {pool}")));
        }
        self.nodes.remove(pool);
        if !self.faults.keep_removed_pool_pending {
            for (kind, status) in &mut self.rotations {
                if kind.requires_workers_rollout() {
                    status.pending_workers_rollouts.remove_pool(pool);
                }
            }
        }
        self.start_reconcile();
        Ok(())
    }
}

#[async_trait]
impl RotationTarget for FakeGarden {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> Result<TargetStatus, ProbeError> {
        self.inner.lock().read_status()
    }

    async fn annotate(&self, operation: &Operation) -> Result<(), ProbeError> {
        self.inner.lock().annotation = Some(operation.to_string());
        Ok(())
    }

    async fn remove_worker_pool(&self, pool: &str) -> Result<(), ProbeError> {
        self.inner.lock().remove_worker_pool(pool)
    }

    async fn node_identities(&self) -> Result<BTreeSet<String>, ProbeError> {
        Ok(self.inner.lock().nodes.values().cloned().collect())
    }
}

#[async_trait]
impl MaterialSource for FakeGarden {
    async fn list_material(&self, domain: &MaterialDomain) -> Result<Vec<Material>, ProbeError> {
        Ok(self.inner.lock().list(domain))
    }
}
