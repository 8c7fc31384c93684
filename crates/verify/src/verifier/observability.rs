use std::sync::Arc;

use async_trait::async_trait;
use credrot_core::CredentialKind;

use super::{HookContext, Verifier};
use crate::error::{VerifyError, VerifyResult};
use crate::poll::Attempt;
use crate::probe::{BasicAuth, ObservabilityProbe};

const OK: u16 = 200;
const UNAUTHORIZED: u16 = 401;

/// Single-phase rotation of the observability login
///
/// The password is replaced within one reconciliation; the username stays.
pub struct ObservabilityVerifier {
    probe: Arc<dyn ObservabilityProbe>,
}

/// Credentials read before the rotation
#[derive(Debug, Default)]
pub struct ObservabilityState {
    old: Option<BasicAuth>,
}

impl ObservabilityVerifier {
    /// Verifier reading and exercising credentials through `probe`
    pub fn new(probe: Arc<dyn ObservabilityProbe>) -> Self {
        Self { probe }
    }

    async fn expect_login(&self, cx: &HookContext<'_>, auth: &BasicAuth, code: u16) -> VerifyResult<()> {
        let condition = format!("observability login answers {code}");
        cx.poller()
            .eventually(&condition, || async {
                match self.probe.login(auth).await? {
                    got if got == code => Ok(()),
                    got => Err(Attempt::retry(format!("status {got}"))),
                }
            })
            .await
    }
}

#[async_trait]
impl Verifier for ObservabilityVerifier {
    type State = ObservabilityState;

    fn name(&self) -> &str {
        "observability"
    }

    async fn before(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        let auth = cx
            .poller()
            .eventually("observability credentials present", || async {
                let auth = self.probe.credentials().await?;
                if auth.is_complete() {
                    Ok(auth)
                } else {
                    Err(Attempt::retry(format!("incomplete credentials for `{}`", auth.username)))
                }
            })
            .await?;

        self.expect_login(cx, &auth, OK).await?;
        state.old = Some(auth);
        Ok(())
    }

    async fn expect_preparing_status(
        &self,
        cx: &HookContext<'_>,
        _state: &mut Self::State,
    ) -> VerifyResult<()> {
        cx.expect_recent_initiation(CredentialKind::Observability)
    }

    async fn after_prepared(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        cx.rotation(CredentialKind::Observability)?
            .check_completed_after_initiation()
            .map_err(|v| VerifyError::status(CredentialKind::Observability, &v))?;

        let Some(old) = state.old.as_ref() else {
            return Err(VerifyError::violation(
                "observability",
                "no credentials were captured before the rotation",
            ));
        };

        cx.poller()
            .consistently("old observability credentials rejected", cx.config.consistency_window, || async {
                match self.probe.login(old).await {
                    Ok(UNAUTHORIZED) => Ok(()),
                    Ok(code) => Err(Attempt::retry(format!("status {code}"))),
                    Err(err) => Err(Attempt::retry(err)),
                }
            })
            .await?;

        let rotated = cx
            .poller()
            .eventually("observability password rotated", || async {
                let auth = self.probe.credentials().await?;
                if auth.username != old.username {
                    return Err(Attempt::Abort(VerifyError::violation(
                        "observability",
                        format!("username changed from `{}` to `{}`", old.username, auth.username),
                    )));
                }
                if auth.password() == old.password() {
                    return Err(Attempt::retry("password unchanged"));
                }
                Ok(auth)
            })
            .await?;

        self.expect_login(cx, &rotated, OK).await?;
        tracing::info!(username = %rotated.username, "Observability credentials rotated");
        Ok(())
    }
}
