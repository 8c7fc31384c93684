//! Timing configuration for verification runs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{VerifyError, VerifyResult};
use crate::poll::Poller;

/// Environment variable overriding [`PollConfig::timeout`]
pub const ENV_POLL_TIMEOUT: &str = "CREDROT_POLL_TIMEOUT";
/// Environment variable overriding [`PollConfig::interval`]
pub const ENV_POLL_INTERVAL: &str = "CREDROT_POLL_INTERVAL";
/// Environment variable overriding [`VerifyConfig::recency_window`]
pub const ENV_RECENCY_WINDOW: &str = "CREDROT_RECENCY_WINDOW";
/// Environment variable overriding [`VerifyConfig::consistency_window`]
pub const ENV_CONSISTENCY_WINDOW: &str = "CREDROT_CONSISTENCY_WINDOW";

/// Bounds of every polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Give up after this long
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Wait between attempts
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(2),
        }
    }
}

/// Verification run configuration
///
/// # Example
///
/// ```rust
/// use credrot_verify::VerifyConfig;
///
/// let config = VerifyConfig::from_json_str(r#"{ "poll": { "timeout": "5m" } }"#).unwrap();
/// assert_eq!(config.poll.timeout.as_secs(), 300);
/// assert_eq!(config.poll.interval.as_secs(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Polling bounds for status, material and probe reads
    pub poll: PollConfig,

    /// Maximum age of a timestamp asserted to have "just happened"
    #[serde(with = "humantime_serde")]
    pub recency_window: Duration,

    /// How long a rejection must hold to count as consistent
    #[serde(with = "humantime_serde")]
    pub consistency_window: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            recency_window: Duration::from_secs(60),
            consistency_window: Duration::from_secs(10),
        }
    }
}

impl VerifyConfig {
    /// Parse and validate a JSON document; missing fields take defaults
    pub fn from_json_str(json: &str) -> VerifyResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| VerifyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with overrides from the process environment
    pub fn from_env() -> VerifyResult<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`, then validate
    pub fn with_overrides<F>(mut self, lookup: F) -> VerifyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str, slot: &mut Duration| -> VerifyResult<()> {
            if let Some(raw) = lookup(name) {
                *slot = humantime_serde::re::humantime::parse_duration(raw.trim())
                    .map_err(|e| VerifyError::Config(format!("{name}={raw}: {e}")))?;
            }
            Ok(())
        };

        read(ENV_POLL_TIMEOUT, &mut self.poll.timeout)?;
        read(ENV_POLL_INTERVAL, &mut self.poll.interval)?;
        read(ENV_RECENCY_WINDOW, &mut self.recency_window)?;
        read(ENV_CONSISTENCY_WINDOW, &mut self.consistency_window)?;

        self.validate()?;
        Ok(self)
    }

    /// Reject settings that would make polling meaningless
    pub fn validate(&self) -> VerifyResult<()> {
        if self.poll.interval.is_zero() {
            return Err(VerifyError::Config("poll interval must be positive".into()));
        }
        if self.poll.interval > self.poll.timeout {
            return Err(VerifyError::Config(format!(
                "poll interval {:?} exceeds timeout {:?}",
                self.poll.interval, self.poll.timeout
            )));
        }
        if self.consistency_window.is_zero() {
            return Err(VerifyError::Config(
                "consistency window must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Poller bounded by [`VerifyConfig::poll`]
    pub fn poller(&self) -> Poller {
        Poller::new(self.poll)
    }

    /// Short timings for tests driven by a paused clock
    pub fn fast() -> Self {
        Self {
            poll: PollConfig {
                timeout: Duration::from_secs(30),
                interval: Duration::from_millis(100),
            },
            recency_window: Duration::from_secs(60),
            consistency_window: Duration::from_secs(1),
        }
    }
}
