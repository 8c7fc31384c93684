//! Control-surface commands
//!
//! A rotation is requested by writing one of these values into the
//! [`OPERATION_ANNOTATION`] of the target resource. The orchestrator removes
//! the annotation once it has picked the command up.

use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::ParseOperationError;

/// Metadata annotation carrying the requested operation
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";

const ROLLOUT_PREFIX: &str = "rotate-rollout-workers=";

/// Operation written to the control annotation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Start a two-phase rotation of all credentials
    RotateCredentialsStart,
    /// Complete a prepared rotation
    RotateCredentialsComplete,
    /// Rotate the node SSH keypair (single phase)
    RotateSshKeypair,
    /// Start a rotation but defer the node rollout
    RotateCredentialsStartWithoutWorkersRollout,
    /// Roll out the named worker pools
    RotateRolloutWorkers(BTreeSet<String>),
}

impl Operation {
    /// Rollout operation for the given pools
    pub fn rollout<I, S>(pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::RotateRolloutWorkers(pools.into_iter().map(Into::into).collect())
    }

    /// Whether this operation starts a new rotation cycle
    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(
            self,
            Self::RotateCredentialsStart
                | Self::RotateCredentialsStartWithoutWorkersRollout
                | Self::RotateSshKeypair
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RotateCredentialsStart => f.write_str("rotate-credentials-start"),
            Self::RotateCredentialsComplete => f.write_str("rotate-credentials-complete"),
            Self::RotateSshKeypair => f.write_str("rotate-ssh-keypair"),
            Self::RotateCredentialsStartWithoutWorkersRollout => {
                f.write_str("rotate-credentials-start-without-workers-rollout")
            }
            Self::RotateRolloutWorkers(pools) => {
                let joined = pools.iter().map(String::as_str).collect::<Vec<_>>().join(",");
                write!(f, "{ROLLOUT_PREFIX}{joined}")
            }
        }
    }
}

impl FromStr for Operation {
    type Err = ParseOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(pools) = s.strip_prefix(ROLLOUT_PREFIX) {
            let pools: BTreeSet<String> = pools
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if pools.is_empty() {
                return Err(ParseOperationError::EmptyRollout);
            }
            return Ok(Self::RotateRolloutWorkers(pools));
        }

        match s {
            "rotate-credentials-start" | "rotate-start" => Ok(Self::RotateCredentialsStart),
            "rotate-credentials-complete" | "rotate-complete" => {
                Ok(Self::RotateCredentialsComplete)
            }
            "rotate-ssh-keypair" => Ok(Self::RotateSshKeypair),
            "rotate-credentials-start-without-workers-rollout"
            | "rotate-start-without-workers-rollout" => {
                Ok(Self::RotateCredentialsStartWithoutWorkersRollout)
            }
            other => Err(ParseOperationError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("rotate-start", Operation::RotateCredentialsStart)]
    #[case("rotate-credentials-complete", Operation::RotateCredentialsComplete)]
    #[case("rotate-ssh-keypair", Operation::RotateSshKeypair)]
    #[case(
        "rotate-start-without-workers-rollout",
        Operation::RotateCredentialsStartWithoutWorkersRollout
    )]
    fn parses_short_and_long_names(#[case] input: &str, #[case] expected: Operation) {
        assert_eq!(input.parse::<Operation>().unwrap(), expected);
    }

    #[test]
    fn rollout_lists_pools_sorted() {
        let op = Operation::rollout(["worker2", "worker1"]);
        assert_eq!(op.to_string(), "rotate-rollout-workers=worker1,worker2");
        assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
    }

    #[test]
    fn rollout_without_pools_is_rejected() {
        assert_eq!(
            "rotate-rollout-workers=".parse::<Operation>().unwrap_err(),
            ParseOperationError::EmptyRollout
        );
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(matches!(
            "reconcile".parse::<Operation>(),
            Err(ParseOperationError::Unknown(op)) if op == "reconcile"
        ));
    }
}
