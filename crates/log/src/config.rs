//! Logger configuration and presets

use serde::{Deserialize, Serialize};

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Multi-line, human oriented
    Pretty,
    /// Single line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl Format {
    /// Parse a format name, falling back to [`Format::Compact`]
    #[must_use]
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "pretty" => Self::Pretty,
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Logger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `EnvFilter` directive, e.g. `info,credrot_verify=debug`
    pub level: String,

    /// Output format
    pub format: Format,

    /// Emit ANSI colors
    pub ansi: bool,

    /// Include the event target (module path)
    pub target: bool,

    /// Name of the run-wide root span; empty disables it
    pub root_span: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Compact,
            ansi: true,
            target: true,
            root_span: String::new(),
        }
    }
}

impl Config {
    /// Configuration from `CREDROT_LOG` / `RUST_LOG` and `CREDROT_LOG_FORMAT`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable lookup
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(level) = lookup("CREDROT_LOG").or_else(|| lookup("RUST_LOG")) {
            config.level = level;
        }
        if let Some(format) = lookup("CREDROT_LOG_FORMAT") {
            config.format = Format::parse_lossy(&format);
        }
        if lookup("NO_COLOR").is_some() {
            config.ansi = false;
        }

        config
    }

    /// Debug level, pretty output
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: Format::Pretty,
            ..Self::default()
        }
    }

    /// Info level, JSON output without colors (CI logs)
    #[must_use]
    pub fn ci() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Json,
            ansi: false,
            ..Self::default()
        }
    }

    /// Set the root span name
    pub fn with_root_span(mut self, name: impl Into<String>) -> Self {
        self.root_span = name.into();
        self
    }
}
