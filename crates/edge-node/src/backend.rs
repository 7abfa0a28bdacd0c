//! Host backend: what this machine can do, decided once at startup, and the
//! narrow seams the command handlers reach the host through.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use el_domain::config::AgentConfig;
use el_node_sdk::MessageKind;
use tokio::process::{Child, Command};

/// Commands the host backend supports.  `info` and `echo` are always on;
/// `attach` and `metrics` never are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub exec: bool,
    pub logs: bool,
    pub port_forward: bool,
}

impl Capabilities {
    /// Probe the host against the agent config.
    pub fn detect(cfg: &AgentConfig) -> Self {
        let exec = cfg.allow_exec && Path::new(SHELL).exists();
        if cfg.allow_exec && !exec {
            tracing::warn!(shell = SHELL, "exec allowed but no shell found; disabling");
        }
        let logs = match &cfg.logs_root {
            Some(root) if root.is_dir() => true,
            Some(root) => {
                tracing::warn!(logs_root = %root.display(), "logs_root is not a directory; disabling logs");
                false
            }
            None => false,
        };
        Self {
            exec,
            logs,
            port_forward: cfg.allow_port_forward,
        }
    }

    pub fn supports(&self, kind: MessageKind) -> bool {
        match kind {
            MessageKind::Exec => self.exec,
            MessageKind::Logs => self.logs,
            MessageKind::PortForward => self.port_forward,
            MessageKind::Info | MessageKind::Echo => true,
            _ => false,
        }
    }

    /// Supported command kinds, ordered by wire code.
    pub fn kinds(&self) -> Vec<MessageKind> {
        [
            MessageKind::Exec,
            MessageKind::Attach,
            MessageKind::Logs,
            MessageKind::PortForward,
            MessageKind::Metrics,
            MessageKind::Info,
            MessageKind::Echo,
        ]
        .into_iter()
        .filter(|k| self.supports(*k))
        .collect()
    }

    /// Capability names as advertised in the handshake.
    pub fn names(&self) -> Vec<String> {
        self.kinds().into_iter().map(|k| k.to_string()).collect()
    }
}

// ── Process launching ────────────────────────────────────────────────

const SHELL: &str = "/bin/sh";

/// A process to start on the host.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub command: String,
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
    /// Pipe stdin from the session; otherwise stdin is `/dev/null`.
    pub stdin: bool,
}

/// Starts host processes for `exec`.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child>;
}

/// Runs commands through `sh -c` with piped stdout / stderr.
#[derive(Debug, Default)]
pub struct ShellLauncher;

impl ProcessLauncher for ShellLauncher {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child> {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(&spec.command)
            .stdin(if spec.stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }
        cmd.envs(&spec.env);
        cmd.spawn()
    }
}

/// Variables a caller may not override: they change what gets loaded or
/// executed.
pub fn is_dangerous_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT",
        "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH", "DYLD_FRAMEWORK_PATH",
        "PATH", "HOME", "USER", "SHELL",
        "SSH_AUTH_SOCK", "SSH_AGENT_PID",
        "PYTHONPATH", "PYTHONSTARTUP", "PYTHONHOME",
        "NODE_PATH", "NODE_OPTIONS",
        "RUBYLIB", "RUBYOPT",
        "PERL5LIB", "PERL5OPT",
        "CLASSPATH",
        "BASH_ENV", "ENV", "CDPATH",
        "IFS",
    ];
    let upper = name.to_ascii_uppercase();
    BLOCKED.contains(&upper.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_support_exec_but_not_port_forward() {
        let caps = Capabilities::detect(&AgentConfig::default());
        assert_eq!(caps.exec, Path::new(SHELL).exists());
        assert!(!caps.logs);
        assert!(!caps.port_forward);
        assert!(caps.supports(MessageKind::Info));
        assert!(!caps.supports(MessageKind::Attach));
        assert!(!caps.supports(MessageKind::Metrics));
    }

    #[test]
    fn logs_need_an_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig {
            logs_root: Some(dir.path().to_path_buf()),
            ..AgentConfig::default()
        };
        assert!(Capabilities::detect(&cfg).logs);

        cfg.logs_root = Some(dir.path().join("missing"));
        assert!(!Capabilities::detect(&cfg).logs);
    }

    #[test]
    fn names_follow_wire_order() {
        let caps = Capabilities {
            exec: true,
            logs: false,
            port_forward: true,
        };
        assert_eq!(caps.names(), vec!["exec", "port_forward", "info", "echo"]);
    }

    #[test]
    fn blocks_loader_variables_case_insensitively() {
        assert!(is_dangerous_env_var("LD_PRELOAD"));
        assert!(is_dangerous_env_var("path"));
        assert!(!is_dangerous_env_var("RUST_LOG"));
    }
}
