use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use credrot_core::CredentialKind;

use super::{HookContext, Verifier};
use crate::error::{CleanupFailure, VerifyError, VerifyResult};
use crate::poll::Attempt;
use crate::probe::{AccessCredential, AccessMethod, AccessProbe};

/// Credentials issued from rotating material stay usable while that
/// material is trusted and are rejected once it is retired
pub struct AccessVerifier {
    kind: CredentialKind,
    prefix: String,
    probe: Arc<dyn AccessProbe>,
}

/// Credentials minted at each checkpoint
#[derive(Debug, Default)]
pub struct AccessState {
    before: Vec<AccessCredential>,
    prepared: Vec<AccessCredential>,
    minted: BTreeSet<AccessMethod>,
}

impl AccessVerifier {
    /// Access to a shoot through `probe`
    pub fn shoot(probe: Arc<dyn AccessProbe>) -> Self {
        Self::new(CredentialKind::ShootAccess, "e2e-rotate", probe)
    }

    /// Access to the virtual garden through `probe`
    pub fn virtual_garden(probe: Arc<dyn AccessProbe>) -> Self {
        Self::new(CredentialKind::VirtualGardenAccess, "e2e-rotate", probe)
    }

    /// Verifier for `kind`; minted objects are named `<prefix>-<method>-<checkpoint>`
    pub fn new(kind: CredentialKind, prefix: impl Into<String>, probe: Arc<dyn AccessProbe>) -> Self {
        Self {
            kind,
            prefix: prefix.into(),
            probe,
        }
    }

    async fn mint_all(
        &self,
        cx: &HookContext<'_>,
        state: &mut AccessState,
        checkpoint: &str,
    ) -> VerifyResult<Vec<AccessCredential>> {
        let mut minted = Vec::with_capacity(AccessMethod::ALL.len());
        for method in AccessMethod::ALL {
            let label = format!("{}-{method}-{checkpoint}", self.prefix);
            // Released in cleanup even when minting never succeeds.
            state.minted.insert(method);
            let credential = cx
                .poller()
                .eventually(&format!("mint {label}"), || async {
                    Ok(AccessCredential::mint(self.probe.as_ref(), method, label.as_str()).await?)
                })
                .await?;
            self.expect_usable(cx, &credential).await?;
            tracing::debug!(kind = %self.kind, %method, label = %label, "Access credential minted");
            minted.push(credential);
        }
        Ok(minted)
    }

    async fn expect_usable(&self, cx: &HookContext<'_>, credential: &AccessCredential) -> VerifyResult<()> {
        cx.poller()
            .eventually(&format!("{} usable", credential.label), || async {
                Ok(credential.check().await?)
            })
            .await
    }

    async fn expect_all_usable(
        &self,
        cx: &HookContext<'_>,
        credentials: &[AccessCredential],
    ) -> VerifyResult<()> {
        for credential in credentials {
            self.expect_usable(cx, credential).await?;
        }
        Ok(())
    }

    async fn expect_rejected(
        &self,
        cx: &HookContext<'_>,
        credentials: &[AccessCredential],
    ) -> VerifyResult<()> {
        for credential in credentials {
            cx.poller()
                .consistently(
                    &format!("{} rejected", credential.label),
                    cx.config.consistency_window,
                    || async {
                        match credential.check().await {
                            Ok(()) => Err(Attempt::retry("request succeeded")),
                            Err(_) => Ok(()),
                        }
                    },
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Verifier for AccessVerifier {
    type State = AccessState;

    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn before(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        let minted = self.mint_all(cx, state, "before").await?;
        state.before = minted;
        Ok(())
    }

    async fn after_prepared(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        self.expect_all_usable(cx, &state.before).await?;
        let minted = self.mint_all(cx, state, "prepared").await?;
        state.prepared = minted;
        Ok(())
    }

    async fn after_completed(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        self.expect_rejected(cx, &state.before).await?;
        self.expect_all_usable(cx, &state.prepared).await?;
        self.mint_all(cx, state, "after").await.map(|_| ())
    }

    async fn cleanup(&self, _cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        let mut failures = Vec::new();
        for method in std::mem::take(&mut state.minted) {
            if let Err(err) = self.probe.release(method).await {
                tracing::warn!(kind = %self.kind, %method, error = %err, "Access cleanup failed");
                failures.push(CleanupFailure {
                    verifier: format!("{}/{method}", self.kind),
                    error: err.to_string(),
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(VerifyError::Cleanup(failures))
        }
    }
}
