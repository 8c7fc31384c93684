//! Shared setup for run-level tests
#![allow(dead_code)]

use std::sync::Arc;

use credrot_verify::credrot_core::CredentialKind;
use credrot_verify::testing::{FakeGarden, Faults};
use credrot_verify::{
    AccessVerifier, EncryptedDataVerifier, EncryptedResource, MaterialDomain, MaterialNames,
    MaterialRotationVerifier, ObservabilityVerifier, RotationDriver, SecretLifecycleTracker,
    VerifierRegistry, VerifyConfig,
};

pub const NAMESPACE: &str = "shoot--local--e2e";
pub const KEY_NAME: &str = "etcd-encryption-key";
pub const KEY_ROLE: &str = "kube-apiserver-etcd-encryption-configuration";
pub const GARDENER_KEY_NAME: &str = "gardener-etcd-encryption-key";
pub const GARDENER_KEY_ROLE: &str = "gardener-apiserver-etcd-encryption-configuration";
pub const CAS: [&str; 2] = ["ca", "ca-client"];

pub fn ca_domain() -> MaterialDomain {
    MaterialDomain::managed_by(CredentialKind::CertificateAuthority, NAMESPACE, "shoot")
}

pub fn sa_domain() -> MaterialDomain {
    MaterialDomain::managed_by(CredentialKind::ServiceAccountKey, NAMESPACE, "shoot")
}

pub fn key_domain() -> MaterialDomain {
    MaterialDomain::managed_by(CredentialKind::EncryptionKey, NAMESPACE, "shoot")
}

/// Garden with two worker pools and every kind rotating
pub fn garden(name: &str, faults: Faults) -> FakeGarden {
    garden_with_cas(name, CAS, faults)
}

/// [`garden`] managing the certificate authorities `cas`
pub fn garden_with_cas<I, S>(name: &str, cas: I, faults: Faults) -> FakeGarden
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut builder = FakeGarden::builder(name)
        .worker_pools(["worker1", "worker2"])
        .material(sa_domain(), MaterialNames::with_bundle("service-account-key"))
        .material(
            key_domain().with_label("role", KEY_ROLE),
            MaterialNames::primary_only(KEY_NAME),
        )
        .material(
            key_domain().with_label("role", GARDENER_KEY_ROLE),
            MaterialNames::primary_only(GARDENER_KEY_NAME),
        )
        .rotating(CredentialKind::Observability)
        .faults(faults);
    for ca in cas {
        builder = builder.material(ca_domain(), MaterialNames::with_bundle(ca));
    }
    builder.build()
}

pub fn tracker(garden: &FakeGarden) -> SecretLifecycleTracker {
    SecretLifecycleTracker::new(Arc::new(garden.clone()), VerifyConfig::fast().poller())
}

/// Material verifiers for the certificate authorities, the service
/// account key and both encryption keys
pub fn material_registry(garden: &FakeGarden) -> VerifierRegistry {
    VerifierRegistry::new()
        .with(MaterialRotationVerifier::certificate_authorities(
            ca_domain(),
            tracker(garden),
            CAS,
        ))
        .with(MaterialRotationVerifier::service_account_key(
            sa_domain(),
            tracker(garden),
        ))
        .with(kube_key_verifier(garden))
        .with(gardener_key_verifier(garden))
}

/// Encryption key of the kube-apiserver
pub fn kube_key_verifier(garden: &FakeGarden) -> MaterialRotationVerifier {
    MaterialRotationVerifier::encryption_key(key_domain(), tracker(garden), KEY_NAME, KEY_ROLE)
}

/// Encryption key of the gardener-apiserver
pub fn gardener_key_verifier(garden: &FakeGarden) -> MaterialRotationVerifier {
    MaterialRotationVerifier::encryption_key(
        key_domain(),
        tracker(garden),
        GARDENER_KEY_NAME,
        GARDENER_KEY_ROLE,
    )
}

pub fn secrets() -> EncryptedResource {
    EncryptedResource::with_payload("secrets", "e2e-rotate-", b"content".to_vec())
}

/// Every verifier this crate ships
pub fn full_registry(garden: &FakeGarden) -> VerifierRegistry {
    material_registry(garden)
        .with(AccessVerifier::shoot(Arc::new(garden.clone())))
        .with(ObservabilityVerifier::new(Arc::new(garden.clone())))
        .with(EncryptedDataVerifier::new(
            Arc::new(garden.clone()),
            vec![secrets()],
        ))
}

pub fn driver(garden: &FakeGarden, registry: VerifierRegistry) -> RotationDriver {
    credrot_log::init_for_tests().expect("test logger");
    RotationDriver::new(Arc::new(garden.clone()), registry, VerifyConfig::fast())
        .expect("fast config is valid")
}
