//! credrot-log - logging setup for verification runs
//!
//! Thin layer over `tracing-subscriber`: pick a level filter and an output
//! format, call [`init`], and every `tracing` event emitted by the driver,
//! registry and verifiers ends up on stderr.
//!
//! ```rust,ignore
//! let _guard = credrot_log::init(&credrot_log::Config::from_env())?;
//! ```
#![forbid(unsafe_code)]

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, Format};
pub use error::{LogError, LogResult};

/// Initialize the global subscriber from `config`.
///
/// Fails when the filter directive does not parse or when a global
/// subscriber was already installed.
pub fn init(config: &Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config.clone()).build()
}

/// Initialize with [`Config::development`] for a test binary
///
/// Tests in one binary share the global subscriber, so a subscriber that is
/// already installed counts as success. Any other failure is returned.
pub fn init_for_tests() -> LogResult<()> {
    match LoggerBuilder::from_config(Config::development()).build() {
        Ok(_) | Err(LogError::AlreadyInitialized(_)) => Ok(()),
        Err(err) => Err(err),
    }
}
