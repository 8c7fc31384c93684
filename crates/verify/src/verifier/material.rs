use async_trait::async_trait;
use credrot_core::CredentialKind;

use super::{HookContext, Verifier};
use crate::error::VerifyResult;
use crate::tracker::{
    Checkpoint, MaterialDomain, MaterialNames, SecretGroup, SecretLifecycleTracker,
    check_checkpoint,
};

/// Certificate authorities of a garden runtime
pub const DEFAULT_CERTIFICATE_AUTHORITIES: [&str; 6] = [
    "ca",
    "ca-client",
    "ca-etcd",
    "ca-etcd-peer",
    "ca-front-proxy",
    "ca-gardener",
];

/// Two-phase material rotation of one management domain
///
/// Covers certificate authorities, the service account signing key and
/// encryption keys: the status must walk through the expected phases with
/// a recent initiation, and the material must follow the 1/2/1 primary
/// count with a fresh bundle at every checkpoint.
#[derive(Debug, Clone)]
pub struct MaterialRotationVerifier {
    name: String,
    domain: MaterialDomain,
    materials: Vec<MaterialNames>,
    tracker: SecretLifecycleTracker,
}

/// Snapshots taken by [`MaterialRotationVerifier`]
#[derive(Debug, Default)]
pub struct MaterialSnapshots {
    before: Option<SecretGroup>,
    prepared: Option<SecretGroup>,
}

impl MaterialRotationVerifier {
    /// Verifier for the named materials of `domain`
    pub fn new(
        name: impl Into<String>,
        domain: MaterialDomain,
        materials: Vec<MaterialNames>,
        tracker: SecretLifecycleTracker,
    ) -> Self {
        Self {
            name: name.into(),
            domain,
            materials,
            tracker,
        }
    }

    /// Certificate authorities named `cas`, each with its `-bundle`
    pub fn certificate_authorities<I, S>(
        domain: MaterialDomain,
        tracker: SecretLifecycleTracker,
        cas: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let materials = cas.into_iter().map(MaterialNames::with_bundle).collect();
        Self::new("certificate-authorities", domain, materials, tracker)
    }

    /// Service account signing key with its bundle
    pub fn service_account_key(domain: MaterialDomain, tracker: SecretLifecycleTracker) -> Self {
        Self::new(
            "service-account-key",
            domain,
            vec![MaterialNames::with_bundle("service-account-key")],
            tracker,
        )
    }

    /// Encryption key `key_name` of the API server carrying `role`
    ///
    /// Encryption keys have no bundle. The `role` label separates the
    /// domains of API servers that share one namespace.
    pub fn encryption_key(
        domain: MaterialDomain,
        tracker: SecretLifecycleTracker,
        key_name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        let key_name = key_name.into();
        Self::new(
            key_name.clone(),
            domain.with_label("role", role),
            vec![MaterialNames::primary_only(key_name)],
            tracker,
        )
    }

    fn kind(&self) -> CredentialKind {
        self.domain.kind
    }

    async fn checkpoint(
        &self,
        checkpoint: Checkpoint,
        previous: Option<&SecretGroup>,
    ) -> VerifyResult<SecretGroup> {
        let current = self.tracker.snapshot(&self.domain).await?;
        for names in &self.materials {
            check_checkpoint(checkpoint, names, &current, previous)?;
        }
        tracing::info!(
            verifier = %self.name,
            kind = %self.kind(),
            %checkpoint,
            snapshot = %current,
            "Material checkpoint verified"
        );
        Ok(current)
    }
}

#[async_trait]
impl Verifier for MaterialRotationVerifier {
    type State = MaterialSnapshots;

    fn name(&self) -> &str {
        &self.name
    }

    fn tracked_kind(&self) -> Option<CredentialKind> {
        Some(self.kind())
    }

    async fn before(&self, _cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        state.before = Some(self.checkpoint(Checkpoint::Before, None).await?);
        Ok(())
    }

    async fn expect_preparing_status(
        &self,
        cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        cx.expect_phase(self.kind())?;
        cx.expect_recent_initiation(self.kind())
    }

    async fn expect_preparing_without_workers_rollout_status(
        &self,
        cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        cx.expect_phase(self.kind())?;
        cx.expect_recent_initiation(self.kind())
    }

    async fn expect_waiting_for_workers_rollout_status(
        &self,
        cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        cx.expect_phase(self.kind())?;
        cx.expect_recent_initiation(self.kind())
    }

    async fn after_prepared(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        cx.expect_phase(self.kind())?;
        let prepared = self
            .checkpoint(Checkpoint::Prepared, state.before.as_ref())
            .await?;
        state.prepared = Some(prepared);
        Ok(())
    }

    async fn expect_completing_status(
        &self,
        cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        cx.expect_phase(self.kind()).map(|_| ())
    }

    async fn after_completed(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        cx.expect_phase(self.kind())?;
        self.checkpoint(Checkpoint::Completed, state.prepared.as_ref())
            .await
            .map(|_| ())
    }
}
