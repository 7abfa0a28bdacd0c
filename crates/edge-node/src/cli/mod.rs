pub mod config;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use el_domain::config::{Config, LogDestination, LogFormat};

/// EdgeLink node agent.
#[derive(Debug, Parser)]
#[command(name = "edgelink-node", version, about)]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short = 'c', env = "EL_CONFIG", default_value = "edgelink.toml", global = true)]
    pub config: PathBuf,

    /// Log filter directive (e.g. "debug" or "info,el_node_sdk=trace").
    /// `RUST_LOG` still takes precedence.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format: json, compact or pretty.
    #[arg(long, global = true, value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to the controller and serve commands (default when no
    /// subcommand is given).
    Run,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

impl Cli {
    /// Fold the logging flags into `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(file) = &self.log_file {
            config.logging.destination = LogDestination::File;
            config.logging.file = Some(file.clone());
        }
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, String> {
    match raw.to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "compact" => Ok(LogFormat::Compact),
        "pretty" => Ok(LogFormat::Pretty),
        other => Err(format!("unknown log format {other:?} (expected json, compact or pretty)")),
    }
}

/// Load the config file.  A missing file yields the defaults, which
/// `validate` then rejects for lack of connectivity methods.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    Config::parse(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["edgelink-node"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("edgelink.toml"));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "edgelink-node",
            "config",
            "show",
            "--config",
            "/etc/edgelink.toml",
            "--log-format",
            "pretty",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::Config(ConfigCommand::Show))));
        assert_eq!(cli.config, PathBuf::from("/etc/edgelink.toml"));
        assert_eq!(cli.log_format, Some(LogFormat::Pretty));
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["edgelink-node", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn log_file_switches_destination() {
        let cli = Cli::try_parse_from([
            "edgelink-node",
            "--log-level",
            "debug",
            "--log-file",
            "/tmp/node.log",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.destination, LogDestination::File);
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/node.log")));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(config.connectivity.is_empty());
    }

    #[test]
    fn malformed_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[agent\nnode_id = 1").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }
}
