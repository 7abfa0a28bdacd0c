mod agent;
mod connectivity;
mod logging;

pub use agent::*;
pub use connectivity::*;
pub use logging::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Transports in the order they appear in the file; sort with
    /// [`sort_by_priority`] before use.
    #[serde(default)]
    pub connectivity: Vec<ConnectivityMethod>,
}

impl Config {
    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> crate::Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Transport names and payload limits are checked later against the
    /// registered transport factories.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.agent.node_id.trim().is_empty() {
            errors.push(ConfigError::error("agent.node_id", "node_id must not be empty"));
        }
        if self.agent.max_concurrent_sessions == 0 {
            errors.push(ConfigError::error(
                "agent.max_concurrent_sessions",
                "must be greater than 0",
            ));
        }
        if self.agent.max_pending_fragments == 0 {
            errors.push(ConfigError::error(
                "agent.max_pending_fragments",
                "must be greater than 0",
            ));
        }
        if self.agent.heartbeat_interval_secs == 0 {
            errors.push(ConfigError::error(
                "agent.heartbeat_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.agent.interactive_flush_ms == 0 || self.agent.bulk_flush_ms == 0 {
            errors.push(ConfigError::error(
                "agent.*_flush_ms",
                "flush timeouts must be greater than 0",
            ));
        }
        if self.agent.interactive_flush_ms > self.agent.bulk_flush_ms {
            errors.push(ConfigError::warning(
                "agent.interactive_flush_ms",
                "interactive flush is slower than bulk flush",
            ));
        }

        if self.logging.destination == LogDestination::File && self.logging.file.is_none() {
            errors.push(ConfigError::error(
                "logging.file",
                "destination \"file\" requires logging.file",
            ));
        }

        if self.connectivity.is_empty() {
            errors.push(ConfigError::error(
                "connectivity",
                "at least one connectivity method is required",
            ));
        }

        let mut priorities = HashSet::new();
        for (i, m) in self.connectivity.iter().enumerate() {
            if m.name.trim().is_empty() {
                errors.push(ConfigError::error(
                    format!("connectivity[{i}].name"),
                    "transport name must not be empty",
                ));
            }
            if m.dial_timeout_ms == 0 {
                errors.push(ConfigError::error(
                    format!("connectivity[{i}].dial_timeout_ms"),
                    "must be greater than 0",
                ));
            }
            if m.initial_backoff_ms == 0 {
                errors.push(ConfigError::error(
                    format!("connectivity[{i}].initial_backoff_ms"),
                    "must be greater than 0",
                ));
            }
            if m.initial_backoff_ms > m.max_backoff_ms {
                errors.push(ConfigError::error(
                    format!("connectivity[{i}].max_backoff_ms"),
                    "max backoff is smaller than initial backoff",
                ));
            }
            if !m.backoff_factor.is_finite() || m.backoff_factor < 1.0 {
                errors.push(ConfigError::error(
                    format!("connectivity[{i}].backoff_factor"),
                    "backoff factor must be a finite number >= 1.0",
                ));
            }
            if !priorities.insert(m.priority) {
                errors.push(ConfigError::warning(
                    format!("connectivity[{i}].priority"),
                    format!("priority {} is shared; file order breaks the tie", m.priority),
                ));
            }
        }

        errors
    }

    /// Whether [`validate`](Self::validate) reports anything fatal.
    pub fn has_errors(issues: &[ConfigError]) -> bool {
        issues.iter().any(|e| e.severity == ConfigSeverity::Error)
    }
}
