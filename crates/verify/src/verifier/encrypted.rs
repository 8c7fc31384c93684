use std::sync::Arc;

use async_trait::async_trait;

use super::{HookContext, Verifier};
use crate::error::{CleanupFailure, VerifyError, VerifyResult};
use crate::poll::Attempt;
use crate::probe::{EncryptedResource, ObjectRef, ProtectedClient, ProtectedObject, ProtectedStore};

/// Data written through protected storage stays readable across a rotation
/// of the key encrypting it
pub struct EncryptedDataVerifier {
    store: Arc<dyn ProtectedStore>,
    resources: Vec<EncryptedResource>,
}

/// Objects written during the run
#[derive(Debug, Default)]
pub struct EncryptedState {
    created: Vec<ObjectRef>,
    written_before: Vec<(ObjectRef, Vec<u8>)>,
}

impl EncryptedDataVerifier {
    /// Verifier writing one object of each of `resources`
    pub fn new(store: Arc<dyn ProtectedStore>, resources: Vec<EncryptedResource>) -> Self {
        Self { store, resources }
    }

    async fn connect(&self, cx: &HookContext<'_>) -> VerifyResult<Arc<dyn ProtectedClient>> {
        cx.poller()
            .eventually("protected store reachable", || async { Ok(self.store.connect().await?) })
            .await
    }

    /// Write a fresh object of every resource and list it back
    async fn round_trip(
        &self,
        cx: &HookContext<'_>,
        client: &dyn ProtectedClient,
        state: &mut EncryptedState,
    ) -> VerifyResult<Vec<(ObjectRef, Vec<u8>)>> {
        let mut written = Vec::with_capacity(self.resources.len());
        for resource in &self.resources {
            let object: ProtectedObject = resource.new_object();
            let created = cx
                .poller()
                .eventually(&format!("create {}", resource.resource), || async {
                    Ok(client.create(&object).await?)
                })
                .await?;
            state.created.push(created.clone());

            cx.poller()
                .eventually(&format!("list {}", resource.resource), || async {
                    match client.list(&resource.resource).await? {
                        0 => Err(Attempt::retry("listing is empty")),
                        _ => Ok(()),
                    }
                })
                .await?;

            tracing::debug!(object = %created, hook = %cx.hook, "Protected object round-tripped");
            written.push((created, object.data));
        }
        Ok(written)
    }

    /// Read back what was written before the rotation
    async fn read_back(
        &self,
        cx: &HookContext<'_>,
        client: &dyn ProtectedClient,
        state: &EncryptedState,
    ) -> VerifyResult<()> {
        for (object, expected) in &state.written_before {
            cx.poller()
                .eventually(&format!("read {object}"), || async {
                    let data = client.read(object).await?;
                    if &data == expected {
                        Ok(())
                    } else {
                        Err(Attempt::Abort(VerifyError::violation(
                            format!("read {object}"),
                            format!("payload changed: {} bytes instead of {}", data.len(), expected.len()),
                        )))
                    }
                })
                .await?;
        }
        Ok(())
    }

    async fn checkpoint(&self, cx: &HookContext<'_>, state: &mut EncryptedState) -> VerifyResult<()> {
        let client = self.connect(cx).await?;
        self.read_back(cx, client.as_ref(), state).await?;
        self.round_trip(cx, client.as_ref(), state).await.map(|_| ())
    }
}

#[async_trait]
impl Verifier for EncryptedDataVerifier {
    type State = EncryptedState;

    fn name(&self) -> &str {
        "encrypted-data"
    }

    async fn before(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        let client = self.connect(cx).await?;
        let written = self.round_trip(cx, client.as_ref(), state).await?;
        state.written_before = written;
        Ok(())
    }

    async fn after_prepared(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        self.checkpoint(cx, state).await
    }

    async fn after_completed(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        self.checkpoint(cx, state).await
    }

    async fn cleanup(&self, cx: &HookContext<'_>, state: &mut Self::State) -> VerifyResult<()> {
        if state.created.is_empty() {
            return Ok(());
        }

        let client = match self.connect(cx).await {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(objects = state.created.len(), error = %err, "Protected store unreachable for cleanup");
                let failures = std::mem::take(&mut state.created)
                    .into_iter()
                    .map(|object| CleanupFailure {
                        verifier: object.to_string(),
                        error: err.to_string(),
                    })
                    .collect();
                return Err(VerifyError::Cleanup(failures));
            }
        };
        let mut failures = Vec::new();
        for object in std::mem::take(&mut state.created) {
            if let Err(err) = client.delete(&object).await {
                tracing::warn!(%object, error = %err, "Protected object cleanup failed");
                failures.push(CleanupFailure {
                    verifier: object.to_string(),
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
