use std::sync::Arc;

use async_trait::async_trait;
use credrot_core::CredentialKind;
use parking_lot::Mutex;

use super::{FakeGarden, Garden, Minted, Stored};
use crate::error::ProbeError;
use crate::probe::{
    AccessClient, AccessMethod, AccessProbe, BasicAuth, ObjectRef, ObservabilityProbe,
    ProtectedClient, ProtectedObject, ProtectedStore,
};

const OBSERVABILITY_USER: &str = "admin";

/// Material a credential minted with `method` is issued from
fn issuer(method: AccessMethod) -> CredentialKind {
    match method {
        AccessMethod::ClientCertificate => CredentialKind::CertificateAuthority,
        AccessMethod::ServiceAccountToken => CredentialKind::ServiceAccountKey,
    }
}

impl Garden {
    fn password(&self) -> String {
        format!("observability-{}", self.password_generation)
    }

    fn accepts_password(&self, password: &str) -> bool {
        if password == self.password() {
            return true;
        }
        self.faults.keep_old_password
            && self
                .password_generation
                .checked_sub(1)
                .is_some_and(|previous| password == format!("observability-{previous}"))
    }

    fn readable(&self, stored: &Stored) -> bool {
        self.trust(CredentialKind::EncryptionKey)
            .trusted
            .contains(&stored.generation)
    }
}

struct FakeAccessClient {
    garden: Arc<Mutex<Garden>>,
    index: usize,
}

#[async_trait]
impl AccessClient for FakeAccessClient {
    async fn round_trip(&self) -> Result<(), ProbeError> {
        let garden = self.garden.lock();
        let minted = garden
            .minted
            .get(self.index)
            .ok_or_else(|| ProbeError::NotFound(format!("credential {}", self.index)))?;
        if garden
            .trust(issuer(minted.method))
            .trusted
            .contains(&minted.generation)
        {
            Ok(())
        } else {
            Err(ProbeError::Unauthorized(format!(
                "{} of generation {} is no longer trusted",
                minted.method, minted.generation
            )))
        }
    }
}

#[async_trait]
impl AccessProbe for FakeGarden {
    fn target(&self) -> &str {
        &self.name
    }

    async fn mint(
        &self,
        method: AccessMethod,
        label: &str,
    ) -> Result<Arc<dyn AccessClient>, ProbeError> {
        let mut garden = self.inner.lock();
        let generation = garden.trust(issuer(method)).newest;
        garden.minted.push(Minted { method, generation });
        tracing::trace!(%method, label, generation, "Credential minted");
        Ok(Arc::new(FakeAccessClient {
            garden: Arc::clone(&self.inner),
            index: garden.minted.len() - 1,
        }))
    }

    async fn release(&self, method: AccessMethod) -> Result<(), ProbeError> {
        let mut garden = self.inner.lock();
        if garden.faults.fail_release {
            return Err(ProbeError::Other(format!("cannot delete {method} objects")));
        }
        garden.released.push(method);
        Ok(())
    }
}

#[async_trait]
impl ObservabilityProbe for FakeGarden {
    async fn credentials(&self) -> Result<BasicAuth, ProbeError> {
        let garden = self.inner.lock();
        Ok(BasicAuth::new(OBSERVABILITY_USER, garden.password()))
    }

    async fn login(&self, auth: &BasicAuth) -> Result<u16, ProbeError> {
        let garden = self.inner.lock();
        if auth.username == OBSERVABILITY_USER && garden.accepts_password(auth.password()) {
            Ok(200)
        } else {
            Ok(401)
        }
    }
}

struct FakeProtectedClient {
    garden: Arc<Mutex<Garden>>,
}

#[async_trait]
impl ProtectedClient for FakeProtectedClient {
    async fn create(&self, object: &ProtectedObject) -> Result<ObjectRef, ProbeError> {
        let mut garden = self.garden.lock();
        let name = format!("{}{}", object.generate_name, garden.next_suffix());
        let generation = garden.trust(CredentialKind::EncryptionKey).newest;
        garden.objects.insert(
            name.clone(),
            Stored {
                resource: object.resource.clone(),
                data: object.data.clone(),
                generation,
            },
        );
        Ok(ObjectRef {
            resource: object.resource.clone(),
            name,
        })
    }

    async fn list(&self, resource: &str) -> Result<usize, ProbeError> {
        let garden = self.garden.lock();
        let mut count = 0;
        for (name, stored) in &garden.objects {
            if stored.resource != resource {
                continue;
            }
            if !garden.readable(stored) {
                return Err(ProbeError::Other(format!("unable to decrypt {resource}/{name}")));
            }
            count += 1;
        }
        Ok(count)
    }

    async fn read(&self, object: &ObjectRef) -> Result<Vec<u8>, ProbeError> {
        let garden = self.garden.lock();
        let stored = garden
            .objects
            .get(&object.name)
            .filter(|stored| stored.resource == object.resource)
            .ok_or_else(|| ProbeError::NotFound(object.to_string()))?;
        if garden.readable(stored) {
            Ok(stored.data.clone())
        } else {
            Err(ProbeError::Other(format!("unable to decrypt {object}")))
        }
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), ProbeError> {
        self.garden
            .lock()
            .objects
            .remove(&object.name)
            .map(|_| ())
            .ok_or_else(|| ProbeError::NotFound(object.to_string()))
    }
}

#[async_trait]
impl ProtectedStore for FakeGarden {
    async fn connect(&self) -> Result<Arc<dyn ProtectedClient>, ProbeError> {
        let mut garden = self.inner.lock();
        garden.connects += 1;
        let connects = garden.connects;
        if garden
            .faults
            .refuse_connects_after
            .is_some_and(|limit| connects > limit)
        {
            return Err(ProbeError::Unavailable("protected store not reachable".into()));
        }
        Ok(Arc::new(FakeProtectedClient {
            garden: Arc::clone(&self.inner),
        }))
    }
}
