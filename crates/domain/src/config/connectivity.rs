use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connectivity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One configured way of reaching the controller.
///
/// `name` selects the transport factory; `options` is the transport's own
/// block and is interpreted only by that factory.  Lower `priority` is tried
/// first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityMethod {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "d_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "d_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "d_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "d_backoff_factor")]
    pub backoff_factor: f64,
    /// Largest frame the transport carries, envelope included.
    #[serde(default = "d_max_payload_size")]
    pub max_payload_size: usize,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ConnectivityMethod {
    /// A method with default timings and no options.
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            dial_timeout_ms: d_dial_timeout_ms(),
            initial_backoff_ms: d_initial_backoff_ms(),
            max_backoff_ms: d_max_backoff_ms(),
            backoff_factor: d_backoff_factor(),
            max_payload_size: d_max_payload_size(),
            options: serde_json::Map::new(),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// String option from the transport block.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

/// Stable sort by ascending priority; equal priorities keep file order.
pub fn sort_by_priority(methods: &mut [ConnectivityMethod]) {
    methods.sort_by_key(|m| m.priority);
}

// ── serde default helpers ───────────────────────────────────────────

fn d_dial_timeout_ms() -> u64 {
    10_000
}

fn d_initial_backoff_ms() -> u64 {
    1_000
}

fn d_max_backoff_ms() -> u64 {
    30_000
}

fn d_backoff_factor() -> f64 {
    2.0
}

fn d_max_payload_size() -> usize {
    64 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_method_uses_defaults() {
        let m: ConnectivityMethod = toml::from_str(r#"name = "websocket""#).unwrap();
        assert_eq!(m.priority, 0);
        assert_eq!(m.dial_timeout(), Duration::from_secs(10));
        assert_eq!(m.initial_backoff(), Duration::from_secs(1));
        assert_eq!(m.max_backoff(), Duration::from_secs(30));
        assert!((m.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(m.max_payload_size, 65_536);
    }

    #[test]
    fn options_block_is_opaque() {
        let m: ConnectivityMethod = toml::from_str(
            r#"
            name = "websocket"
            [options]
            url = "ws://controller:7000/v1/agents"
            token = "t0k"
        "#,
        )
        .unwrap();
        assert_eq!(m.option_str("url"), Some("ws://controller:7000/v1/agents"));
        assert_eq!(m.option_str("token"), Some("t0k"));
        assert_eq!(m.option_str("missing"), None);
    }

    #[test]
    fn priority_sort_is_stable() {
        let mut methods = vec![
            ConnectivityMethod::new("b", 5),
            ConnectivityMethod::new("a", 1),
            ConnectivityMethod::new("c", 5),
            ConnectivityMethod::new("d", 0),
        ];
        sort_by_priority(&mut methods);
        let names: Vec<_> = methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["d", "a", "b", "c"]);
    }
}
