//! Credential material snapshots
//!
//! The [`SecretLifecycleTracker`] lists the material of one management
//! domain, groups it by logical name and compares snapshots taken at the
//! rotation checkpoints. The count and retention laws of a two-phase
//! rotation are checked by [`check_checkpoint`]:
//!
//! | checkpoint | primary | bundle                     |
//! |------------|---------|----------------------------|
//! | Before     | 1       | 1                          |
//! | Prepared   | 2       | 1, differs from Before     |
//! | Completed  | 1       | 1, differs from Prepared   |
//!
//! The Before primary is retained at Prepared and pruned at Completed; the
//! primary added at Prepared is the one that survives.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credrot_core::CredentialKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, VerifyError, VerifyResult};
use crate::poll::{Attempt, Poller};

/// Label carrying the logical name of a piece of material
pub const NAME_LABEL: &str = "name";
/// Label identifying the subsystem that manages the material
pub const MANAGED_BY_LABEL: &str = "managed-by";
/// Value of [`MANAGED_BY_LABEL`] for rotation-managed material
pub const SECRETS_MANAGER: &str = "secrets-manager";
/// Label carrying the identity of the managing instance
pub const MANAGER_IDENTITY_LABEL: &str = "manager-identity";

/// One credential object as listed from the material surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    /// Object name, unique within the domain
    pub name: String,
    /// Object labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Material {
    /// Material named `name` with no labels
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            created_at,
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Logical name this material is grouped under
    ///
    /// Taken from the [`NAME_LABEL`] when present, otherwise the object name
    /// with its generation suffix stripped.
    pub fn logical_name(&self) -> &str {
        match self.labels.get(NAME_LABEL) {
            Some(name) => name,
            None => strip_generation_suffix(&self.name),
        }
    }
}

/// `ca-bundle-7f3a9c21` → `ca-bundle`; names without a suffix are kept
fn strip_generation_suffix(name: &str) -> &str {
    let Some((base, suffix)) = name.rsplit_once('-') else {
        return name;
    };
    let generated = (5..=10).contains(&suffix.len())
        && suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && suffix.chars().any(|c| c.is_ascii_digit());
    if generated && !base.is_empty() { base } else { name }
}

/// Selects the material of one management domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialDomain {
    /// Kind the material belongs to
    pub kind: CredentialKind,
    /// Namespace the material lives in
    pub namespace: String,
    /// Labels every selected object must carry
    pub selector: BTreeMap<String, String>,
}

impl MaterialDomain {
    /// Domain of `kind` in `namespace` without label constraints
    pub fn new(kind: CredentialKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            selector: BTreeMap::new(),
        }
    }

    /// Material managed by the secrets manager instance `identity`
    pub fn managed_by(
        kind: CredentialKind,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self::new(kind, namespace)
            .with_label(MANAGED_BY_LABEL, SECRETS_MANAGER)
            .with_label(MANAGER_IDENTITY_LABEL, identity)
    }

    /// Require an additional label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selector.insert(key.into(), value.into());
        self
    }

    /// Whether `material` carries every selector label
    pub fn matches(&self, material: &Material) -> bool {
        self.selector
            .iter()
            .all(|(key, value)| material.labels.get(key) == Some(value))
    }
}

/// Lists credential material
#[async_trait]
pub trait MaterialSource: Send + Sync {
    /// Every object in `domain.namespace` matching `domain`'s selector
    async fn list_material(&self, domain: &MaterialDomain) -> Result<Vec<Material>, ProbeError>;
}

/// Material of one domain grouped by logical name
///
/// Identities within a group are ordered oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretGroup {
    groups: BTreeMap<String, Vec<String>>,
}

impl SecretGroup {
    /// Group `materials` by [`Material::logical_name`]
    pub fn from_materials<'a, I>(materials: I) -> Self
    where
        I: IntoIterator<Item = &'a Material>,
    {
        let mut sorted: Vec<&Material> = materials.into_iter().collect();
        sorted.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for material in sorted {
            groups
                .entry(material.logical_name().to_string())
                .or_default()
                .push(material.name.clone());
        }
        Self { groups }
    }

    /// Identities grouped under `name`, oldest first
    pub fn get(&self, name: &str) -> &[String] {
        self.groups.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of identities under `name`
    pub fn count(&self, name: &str) -> usize {
        self.get(name).len()
    }

    /// Oldest identity under `name`
    pub fn oldest(&self, name: &str) -> Option<&str> {
        self.get(name).first().map(String::as_str)
    }

    /// Newest identity under `name`
    pub fn newest(&self, name: &str) -> Option<&str> {
        self.get(name).last().map(String::as_str)
    }

    /// Logical names present
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Every identity across all groups
    pub fn identities(&self) -> BTreeSet<String> {
        self.groups.values().flatten().cloned().collect()
    }
}

impl std::fmt::Display for SecretGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, ids) in &self.groups {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{name}=[{}]", ids.join(" "))?;
        }
        if first {
            f.write_str("<empty>")?;
        }
        Ok(())
    }
}

/// Identity-level difference between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// Present in both snapshots
    pub retained: BTreeSet<String>,
    /// Present only in the later snapshot
    pub added: BTreeSet<String>,
    /// Present only in the earlier snapshot
    pub removed: BTreeSet<String>,
}

impl SnapshotDiff {
    /// Compare `before` and `after` by identity
    pub fn between(before: &SecretGroup, after: &SecretGroup) -> Self {
        let before = before.identities();
        let after = after.identities();
        Self {
            retained: before.intersection(&after).cloned().collect(),
            added: after.difference(&before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
        }
    }
}

impl std::fmt::Display for SnapshotDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(" ");
        write!(
            f,
            "retained=[{}] added=[{}] removed=[{}]",
            list(&self.retained),
            list(&self.added),
            list(&self.removed)
        )
    }
}

/// Snapshot instant within a rotation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// Before the start command
    Before,
    /// Old and new material both trusted
    Prepared,
    /// Old material retired
    Completed,
}

impl Checkpoint {
    /// Expected number of primary identities
    pub fn primary_count(self) -> usize {
        match self {
            Self::Prepared => 2,
            Self::Before | Self::Completed => 1,
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Before => "Before",
            Self::Prepared => "Prepared",
            Self::Completed => "Completed",
        })
    }
}

/// Logical names of one rotated secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialNames {
    /// Signing or encryption material
    pub primary: String,
    /// Derived trust bundle, if the material has one
    pub bundle: Option<String>,
}

impl MaterialNames {
    /// Primary with its conventional `<primary>-bundle`
    pub fn with_bundle(primary: impl Into<String>) -> Self {
        let primary = primary.into();
        let bundle = format!("{primary}-bundle");
        Self {
            primary,
            bundle: Some(bundle),
        }
    }

    /// Primary without a bundle
    pub fn primary_only(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            bundle: None,
        }
    }
}

/// Check the count and retention laws of `names` at `checkpoint`
///
/// `previous` is the snapshot of the preceding checkpoint and is required
/// for every checkpoint but [`Checkpoint::Before`].
pub fn check_checkpoint(
    checkpoint: Checkpoint,
    names: &MaterialNames,
    current: &SecretGroup,
    previous: Option<&SecretGroup>,
) -> VerifyResult<()> {
    let check = format!("{} at {checkpoint}", names.primary);
    let diff = || previous.map(|prev| SnapshotDiff::between(prev, current)).unwrap_or_default();
    let violation = |detail: String| VerifyError::violation_with_diff(&check, detail, diff());

    let expected = checkpoint.primary_count();
    if current.count(&names.primary) != expected {
        return Err(violation(format!(
            "expected {expected} `{}` identities, found {}: {current}",
            names.primary,
            current.count(&names.primary)
        )));
    }
    if let Some(bundle) = &names.bundle
        && current.count(bundle) != 1
    {
        return Err(violation(format!(
            "expected 1 `{bundle}` identity, found {}: {current}",
            current.count(bundle)
        )));
    }

    let Some(previous) = previous else {
        return match checkpoint {
            Checkpoint::Before => Ok(()),
            _ => Err(VerifyError::violation(
                &check,
                "no snapshot of the preceding checkpoint",
            )),
        };
    };

    // Prepared retains the Before primary; Completed keeps only the newest
    // primary of Prepared and drops the oldest one.
    match checkpoint {
        Checkpoint::Before => {}
        Checkpoint::Prepared => {
            if let Some(old) = previous.oldest(&names.primary)
                && !current.get(&names.primary).iter().any(|id| id == old)
            {
                return Err(violation(format!("old primary `{old}` was not retained")));
            }
        }
        Checkpoint::Completed => {
            if let Some(new) = previous.newest(&names.primary)
                && !current.get(&names.primary).iter().any(|id| id == new)
            {
                return Err(violation(format!("new primary `{new}` was not kept")));
            }
            if let Some(old) = previous.oldest(&names.primary)
                && current.get(&names.primary).iter().any(|id| id == old)
            {
                return Err(violation(format!("old primary `{old}` was not pruned")));
            }
        }
    }

    if let Some(bundle) = &names.bundle
        && current.get(bundle) == previous.get(bundle)
    {
        return Err(violation(format!(
            "bundle `{bundle}` was not superseded: still {:?}",
            current.get(bundle)
        )));
    }

    Ok(())
}

/// Takes settled snapshots of a material domain
#[derive(Clone)]
pub struct SecretLifecycleTracker {
    source: Arc<dyn MaterialSource>,
    poller: Poller,
}

impl std::fmt::Debug for SecretLifecycleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretLifecycleTracker")
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

impl SecretLifecycleTracker {
    /// Tracker reading from `source`
    pub fn new(source: Arc<dyn MaterialSource>, poller: Poller) -> Self {
        Self { source, poller }
    }

    /// Grouped material of `domain`
    ///
    /// A single listing is not authoritative: the snapshot is taken once two
    /// consecutive successful listings agree, bounded by the poll timeout.
    pub async fn snapshot(&self, domain: &MaterialDomain) -> VerifyResult<SecretGroup> {
        let condition = format!("settled {} material in {}", domain.kind, domain.namespace);
        let previous: Mutex<Option<SecretGroup>> = Mutex::new(None);

        let group = self
            .poller
            .eventually(&condition, || {
                let source = Arc::clone(&self.source);
                let previous = &previous;
                async move {
                    let listed = source.list_material(domain).await?;
                    let group = SecretGroup::from_materials(
                        listed.iter().filter(|material| domain.matches(material)),
                    );
                    let mut prior = previous.lock();
                    if prior.as_ref() == Some(&group) {
                        return Ok(group);
                    }
                    let observed = group.to_string();
                    *prior = Some(group);
                    Err(Attempt::Retry(format!("listing still changing: {observed}")))
                }
            })
            .await?;

        tracing::debug!(kind = %domain.kind, snapshot = %group, "Material snapshot taken");
        Ok(group)
    }

    /// Identity-level difference between two snapshots
    pub fn diff(before: &SecretGroup, after: &SecretGroup) -> SnapshotDiff {
        SnapshotDiff::between(before, after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollConfig;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn group(entries: &[(&str, &str, i64)]) -> SecretGroup {
        let materials: Vec<Material> = entries
            .iter()
            .map(|(name, logical, created)| {
                Material::new(*name, at(*created)).with_label(NAME_LABEL, *logical)
            })
            .collect();
        SecretGroup::from_materials(&materials)
    }

    fn ca() -> MaterialNames {
        MaterialNames::with_bundle("ca")
    }

    #[rstest]
    #[case("ca-bundle-7f3a9c21", "ca-bundle")]
    #[case("ca-5d2e1", "ca")]
    #[case("ca-client", "ca-client")]
    #[case("service-account-key", "service-account-key")]
    #[case("observability", "observability")]
    fn strips_generation_suffix(#[case] name: &str, #[case] logical: &str) {
        assert_eq!(Material::new(name, at(0)).logical_name(), logical);
    }

    #[test]
    fn groups_oldest_first() {
        let snapshot = group(&[("ca-b2", "ca", 20), ("ca-a1", "ca", 10), ("ca-bundle-x", "ca-bundle", 20)]);
        assert_eq!(snapshot.get("ca"), ["ca-a1", "ca-b2"]);
        assert_eq!(snapshot.oldest("ca"), Some("ca-a1"));
        assert_eq!(snapshot.newest("ca"), Some("ca-b2"));
        assert_eq!(snapshot.count("missing"), 0);
    }

    #[test]
    fn diff_by_identity() {
        let before = group(&[("ca-1", "ca", 0), ("ca-bundle-1", "ca-bundle", 0)]);
        let after = group(&[("ca-1", "ca", 0), ("ca-2", "ca", 5), ("ca-bundle-2", "ca-bundle", 5)]);
        let diff = SecretLifecycleTracker::diff(&before, &after);
        assert_eq!(diff.retained, BTreeSet::from(["ca-1".to_string()]));
        assert_eq!(
            diff.added,
            BTreeSet::from(["ca-2".to_string(), "ca-bundle-2".to_string()])
        );
        assert_eq!(diff.removed, BTreeSet::from(["ca-bundle-1".to_string()]));
    }

    #[test]
    fn full_cycle_satisfies_the_laws() {
        let before = group(&[("ca-1", "ca", 0), ("ca-bundle-1", "ca-bundle", 0)]);
        let prepared = group(&[("ca-1", "ca", 0), ("ca-2", "ca", 5), ("ca-bundle-2", "ca-bundle", 5)]);
        let completed = group(&[("ca-2", "ca", 5), ("ca-bundle-3", "ca-bundle", 9)]);

        check_checkpoint(Checkpoint::Before, &ca(), &before, None).unwrap();
        check_checkpoint(Checkpoint::Prepared, &ca(), &prepared, Some(&before)).unwrap();
        check_checkpoint(Checkpoint::Completed, &ca(), &completed, Some(&prepared)).unwrap();
    }

    #[test]
    fn unpruned_primary_is_a_violation_with_diff() {
        let prepared = group(&[("ca-1", "ca", 0), ("ca-2", "ca", 5), ("ca-bundle-2", "ca-bundle", 5)]);
        let completed = group(&[("ca-1", "ca", 0), ("ca-2", "ca", 5), ("ca-bundle-3", "ca-bundle", 9)]);

        let err = check_checkpoint(Checkpoint::Completed, &ca(), &completed, Some(&prepared))
            .unwrap_err();
        assert!(err.is_violation());
        let diff = err.diff().unwrap();
        assert!(diff.retained.contains("ca-1"));
        assert!(diff.removed.contains("ca-bundle-2"));
    }

    #[test]
    fn replaced_old_primary_is_not_retention() {
        let before = group(&[("ca-1", "ca", 0), ("ca-bundle-1", "ca-bundle", 0)]);
        let prepared = group(&[("ca-2", "ca", 5), ("ca-3", "ca", 6), ("ca-bundle-2", "ca-bundle", 5)]);
        let err = check_checkpoint(Checkpoint::Prepared, &ca(), &prepared, Some(&before)).unwrap_err();
        assert!(err.to_string().contains("not retained"), "{err}");
    }

    #[test]
    fn unchanged_bundle_is_a_violation() {
        let before = group(&[("ca-1", "ca", 0), ("ca-bundle-1", "ca-bundle", 0)]);
        let prepared = group(&[("ca-1", "ca", 0), ("ca-2", "ca", 5), ("ca-bundle-1", "ca-bundle", 0)]);
        let err = check_checkpoint(Checkpoint::Prepared, &ca(), &prepared, Some(&before)).unwrap_err();
        assert!(err.to_string().contains("not superseded"), "{err}");
    }

    #[test]
    fn encryption_key_has_no_bundle() {
        let key = MaterialNames::primary_only("etcd-encryption-key");
        let before = group(&[("etcd-encryption-key-1", "etcd-encryption-key", 0)]);
        check_checkpoint(Checkpoint::Before, &key, &before, None).unwrap();
    }

    struct Listing(Vec<Material>);

    #[async_trait]
    impl MaterialSource for Listing {
        async fn list_material(&self, _domain: &MaterialDomain) -> Result<Vec<Material>, ProbeError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_filters_by_selector() {
        let domain = MaterialDomain::managed_by(CredentialKind::CertificateAuthority, "garden", "shoot--foo");
        let managed = |name: &str| {
            Material::new(name, at(0))
                .with_label(MANAGED_BY_LABEL, SECRETS_MANAGER)
                .with_label(MANAGER_IDENTITY_LABEL, "shoot--foo")
        };
        let source = Listing(vec![
            managed("ca-a1b2c3"),
            managed("ca-bundle-d4e5f6"),
            Material::new("ca-unmanaged1", at(0)),
        ]);
        let tracker = SecretLifecycleTracker::new(
            Arc::new(source),
            Poller::new(PollConfig {
                timeout: Duration::from_secs(5),
                interval: Duration::from_secs(1),
            }),
        );

        let snapshot = tracker.snapshot(&domain).await.unwrap();
        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["ca", "ca-bundle"]);
    }

    #[tokio::test(start_paused = true)]
    async fn role_label_separates_encryption_keys() {
        let domain = MaterialDomain::managed_by(CredentialKind::EncryptionKey, "garden", "garden");
        let key = |name: &str, role: &str| {
            Material::new(name, at(0))
                .with_label(MANAGED_BY_LABEL, SECRETS_MANAGER)
                .with_label(MANAGER_IDENTITY_LABEL, "garden")
                .with_label(NAME_LABEL, "etcd-encryption-key")
                .with_label("role", role)
        };
        let source = Arc::new(Listing(vec![
            key("etcd-encryption-key-a1b2c", "kube-apiserver-etcd-encryption-configuration"),
            key("etcd-encryption-key-d3e4f", "gardener-apiserver-etcd-encryption-configuration"),
            key("etcd-encryption-key-g5h6i", "gardener-apiserver-etcd-encryption-configuration"),
        ]));
        let tracker = SecretLifecycleTracker::new(source, Poller::new(PollConfig::default()));

        let kube = tracker
            .snapshot(&domain.clone().with_label("role", "kube-apiserver-etcd-encryption-configuration"))
            .await
            .unwrap();
        let gardener = tracker
            .snapshot(&domain.with_label("role", "gardener-apiserver-etcd-encryption-configuration"))
            .await
            .unwrap();

        assert_eq!(kube.count("etcd-encryption-key"), 1);
        assert_eq!(gardener.count("etcd-encryption-key"), 2);
    }
}
