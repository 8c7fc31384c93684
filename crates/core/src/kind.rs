//! Credential kinds

use serde::{Deserialize, Serialize};

/// Kind of credential whose rotation is verified
///
/// Serialized with the field names of the orchestrator's
/// `status.credentials.rotation` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialKind {
    /// Cluster, client, etcd, front-proxy … certificate authorities
    #[serde(rename = "certificateAuthorities")]
    CertificateAuthority,
    /// Key signing service account tokens
    ServiceAccountKey,
    /// Key encrypting resources at rest
    #[serde(rename = "etcdEncryptionKey")]
    EncryptionKey,
    /// Basic-auth credentials of the observability stack
    Observability,
    /// Certificates and tokens used to reach a shoot
    ShootAccess,
    /// Certificates and tokens used to reach the virtual garden
    VirtualGardenAccess,
    /// Resources stored encrypted with the encryption key
    EncryptedResource,
}

/// How a kind moves through the rotation phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RotationFamily {
    /// Prepare establishes overlap, complete retires the old material
    TwoPhase,
    /// Rotation finishes within one reconciliation
    SinglePhase,
    /// No status of its own; follows the material it is issued from
    Derived,
}

impl CredentialKind {
    /// Every kind, in declaration order
    pub const ALL: [Self; 7] = [
        Self::CertificateAuthority,
        Self::ServiceAccountKey,
        Self::EncryptionKey,
        Self::Observability,
        Self::ShootAccess,
        Self::VirtualGardenAccess,
        Self::EncryptedResource,
    ];

    /// Rotation family of this kind
    #[must_use]
    pub fn family(self) -> RotationFamily {
        match self {
            Self::CertificateAuthority | Self::ServiceAccountKey | Self::EncryptionKey => {
                RotationFamily::TwoPhase
            }
            Self::Observability => RotationFamily::SinglePhase,
            Self::ShootAccess | Self::VirtualGardenAccess | Self::EncryptedResource => {
                RotationFamily::Derived
            }
        }
    }

    /// Whether rotated material must reach the nodes through a worker rollout
    #[must_use]
    pub fn requires_workers_rollout(self) -> bool {
        matches!(self, Self::CertificateAuthority | Self::ServiceAccountKey)
    }

    /// Whether the orchestrator reports a rotation status for this kind
    #[must_use]
    pub fn has_status(self) -> bool {
        self.family() != RotationFamily::Derived
    }

    /// Stable lowercase name used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CertificateAuthority => "certificate-authorities",
            Self::ServiceAccountKey => "service-account-key",
            Self::EncryptionKey => "encryption-key",
            Self::Observability => "observability",
            Self::ShootAccess => "shoot-access",
            Self::VirtualGardenAccess => "virtual-garden-access",
            Self::EncryptedResource => "encrypted-resource",
        }
    }
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
