//! Live access probes
//!
//! Collaborator interfaces that turn rotated material into something that
//! can be exercised: clients scoped to freshly minted credentials, objects
//! written through protected storage, and the observability endpoint's
//! basic-auth login. Transports are supplied by the caller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

/// How an access credential is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessMethod {
    /// Client certificate issued through a signing request
    ClientCertificate,
    /// Token of a dynamically created service account
    ServiceAccountToken,
}

impl AccessMethod {
    /// Both methods, certificate first
    pub const ALL: [Self; 2] = [Self::ClientCertificate, Self::ServiceAccountToken];

    /// Short name used in object names and logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientCertificate => "csr",
            Self::ServiceAccountToken => "sa-dynamic",
        }
    }
}

impl std::fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client bound to one minted credential
#[async_trait]
pub trait AccessClient: Send + Sync {
    /// Perform one authenticated request
    async fn round_trip(&self) -> Result<(), ProbeError>;
}

/// Mints credentials against a target endpoint
#[async_trait]
pub trait AccessProbe: Send + Sync {
    /// Endpoint the minted credentials are valid for
    fn target(&self) -> &str;

    /// Mint a credential with `method`; `label` names the objects created
    async fn mint(&self, method: AccessMethod, label: &str)
    -> Result<Arc<dyn AccessClient>, ProbeError>;

    /// Delete every object created for `method`
    async fn release(&self, method: AccessMethod) -> Result<(), ProbeError>;
}

/// A minted credential and the client using it
#[derive(Clone)]
pub struct AccessCredential {
    /// How it was minted
    pub method: AccessMethod,
    /// When it was minted
    pub minted_at: DateTime<Utc>,
    /// Endpoint it grants access to
    pub target: String,
    /// Name of the created objects
    pub label: String,
    client: Arc<dyn AccessClient>,
}

impl std::fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessCredential")
            .field("method", &self.method)
            .field("minted_at", &self.minted_at)
            .field("target", &self.target)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl AccessCredential {
    /// Mint a credential through `probe`
    pub async fn mint(
        probe: &dyn AccessProbe,
        method: AccessMethod,
        label: impl Into<String>,
    ) -> Result<Self, ProbeError> {
        let label = label.into();
        let client = probe.mint(method, &label).await?;
        Ok(Self {
            method,
            minted_at: Utc::now(),
            target: probe.target().to_string(),
            label,
            client,
        })
    }

    /// Use the credential once
    pub async fn check(&self) -> Result<(), ProbeError> {
        self.client.round_trip().await
    }
}

/// Object written through protected storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedObject {
    /// Resource type, e.g. `secrets` or `configmaps`
    pub resource: String,
    /// Name prefix; the store appends a unique suffix
    pub generate_name: String,
    /// Payload that must survive re-encryption
    pub data: Vec<u8>,
}

/// Reference to a created object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Resource type
    pub resource: String,
    /// Assigned name
    pub name: String,
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource, self.name)
    }
}

/// A resource type stored encrypted at rest
///
/// `new_object` produces a fresh object to write; listing uses
/// `resource` as the empty-listing type.
#[derive(Clone)]
pub struct EncryptedResource {
    /// Resource type listed after each write
    pub resource: String,
    new_object: Arc<dyn Fn() -> ProtectedObject + Send + Sync>,
}

impl std::fmt::Debug for EncryptedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedResource")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl EncryptedResource {
    /// Resource type with its object factory
    pub fn new<F>(resource: impl Into<String>, new_object: F) -> Self
    where
        F: Fn() -> ProtectedObject + Send + Sync + 'static,
    {
        Self {
            resource: resource.into(),
            new_object: Arc::new(new_object),
        }
    }

    /// Resource type writing `data` under `generate_name`
    pub fn with_payload(
        resource: impl Into<String>,
        generate_name: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        let resource = resource.into();
        let object = ProtectedObject {
            resource: resource.clone(),
            generate_name: generate_name.into(),
            data: data.into(),
        };
        Self::new(resource, move || object.clone())
    }

    /// A fresh object to write
    pub fn new_object(&self) -> ProtectedObject {
        (self.new_object)()
    }
}

/// Client of the protected store
#[async_trait]
pub trait ProtectedClient: Send + Sync {
    /// Write `object`, returning its assigned name
    async fn create(&self, object: &ProtectedObject) -> Result<ObjectRef, ProbeError>;

    /// List every object of `resource`; returns how many were decoded
    async fn list(&self, resource: &str) -> Result<usize, ProbeError>;

    /// Read back one object's payload
    async fn read(&self, object: &ObjectRef) -> Result<Vec<u8>, ProbeError>;

    /// Delete one object
    async fn delete(&self, object: &ObjectRef) -> Result<(), ProbeError>;
}

/// Opens clients of the protected store
#[async_trait]
pub trait ProtectedStore: Send + Sync {
    /// Client with the store's current access credentials
    async fn connect(&self) -> Result<Arc<dyn ProtectedClient>, ProbeError>;
}

/// Basic-auth credentials of the observability endpoint
#[derive(Clone)]
pub struct BasicAuth {
    /// Login name
    pub username: String,
    password: SecretString,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl BasicAuth {
    /// Credentials from their parts
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Password in clear text
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Both parts are non-empty
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password().is_empty()
    }
}

/// Observability secret and endpoint
#[async_trait]
pub trait ObservabilityProbe: Send + Sync {
    /// Current contents of the observability secret
    async fn credentials(&self) -> Result<BasicAuth, ProbeError>;

    /// Log in with `auth`, returning the HTTP status code
    async fn login(&self, auth: &BasicAuth) -> Result<u16, ProbeError>;
}
