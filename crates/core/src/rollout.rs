//! Worker pools pending a node rollout

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::operation::Operation;

/// Set of worker pools whose nodes have not yet adopted rotated material
///
/// Filled when a rotation is prepared without rolling out the workers.
/// A pool leaves the set when a rollout names it or when it is removed
/// from the target's spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerPoolRollouts(BTreeSet<String>);

impl WorkerPoolRollouts {
    /// Set holding `pools`
    pub fn from_pools<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(pools.into_iter().map(Into::into).collect())
    }

    /// No pool pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of pending pools
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether `pool` is pending
    #[must_use]
    pub fn contains(&self, pool: &str) -> bool {
        self.0.contains(pool)
    }

    /// Pending pool names, sorted
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Add every pool of `other`
    pub fn extend(&mut self, other: &Self) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Drop a pool that no longer exists in the target's spec
    pub fn remove_pool(&mut self, pool: &str) -> bool {
        self.0.remove(pool)
    }

    /// Apply a rollout naming `requested`; returns whether nothing is left
    ///
    /// Names that are not pending are ignored, so a rollout of a strict
    /// subset keeps the remaining pools pending.
    pub fn roll_out(&mut self, requested: &BTreeSet<String>) -> bool {
        self.0.retain(|pool| !requested.contains(pool));
        self.0.is_empty()
    }

    /// Rollout operation naming exactly the pending pools
    #[must_use]
    pub fn to_operation(&self) -> Option<Operation> {
        (!self.is_empty()).then(|| Operation::RotateRolloutWorkers(self.0.clone()))
    }
}

impl FromIterator<String> for WorkerPoolRollouts {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(pools: &[&str]) -> BTreeSet<String> {
        pools.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn subset_rollout_keeps_remaining_pools() {
        let mut pending = WorkerPoolRollouts::from_pools(["a", "b", "c"]);
        assert!(!pending.roll_out(&names(&["a"])));
        assert_eq!(pending.iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn exact_rollout_empties_the_set() {
        let mut pending = WorkerPoolRollouts::from_pools(["a", "b"]);
        assert!(pending.roll_out(&names(&["b", "a"])));
        assert_eq!(pending.to_operation(), None);
    }

    #[test]
    fn removed_pool_is_no_longer_pending() {
        let mut pending = WorkerPoolRollouts::from_pools(["worker", "worker2"]);
        assert!(pending.remove_pool("worker2"));
        assert!(!pending.contains("worker2"));
        assert_eq!(
            pending.to_operation().map(|op| op.to_string()),
            Some("rotate-rollout-workers=worker".to_string())
        );
    }
}
