use std::path::Path;

use el_domain::config::{Config, ConfigSeverity};

/// Validate the config, printing any issues.  Returns `false` when at least
/// one issue is an error.
pub fn validate(config: &Config, config_path: &Path) -> bool {
    let issues = config.validate();

    if issues.is_empty() {
        println!("Config OK ({})", config_path.display());
        return true;
    }

    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }

    println!(
        "\n{} error(s), {} warning(s) in {}",
        error_count,
        warning_count,
        config_path.display(),
    );

    error_count == 0
}

/// Render the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &Config) -> anyhow::Result<String> {
    toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("failed to serialize config: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_fills_in_defaults() {
        let config = Config::parse(
            r#"
            [[connectivity]]
            name = "websocket"
            [connectivity.options]
            url = "ws://controller:7000/v1/agents"
        "#,
        )
        .unwrap();
        let out = show(&config).unwrap();
        assert!(out.contains("heartbeat_interval_secs = 30"));
        assert!(out.contains("dial_timeout_ms = 10000"));
        assert!(out.contains("ws://controller:7000/v1/agents"));

        let reparsed = Config::parse(&out).unwrap();
        assert_eq!(reparsed.connectivity.len(), 1);
    }

    #[test]
    fn validate_reports_errors() {
        assert!(!validate(&Config::default(), Path::new("edgelink.toml")));
    }
}
