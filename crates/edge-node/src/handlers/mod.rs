//! Host command handlers.
//!
//! Only commands the [`Capabilities`] set allows are registered; anything
//! else (including `attach` and `metrics`) falls through to the dispatch
//! table's `not_supported` reply.

pub mod echo;
pub mod exec;
pub mod info;
pub mod logs;
pub mod port_forward;

use std::sync::Arc;

use el_domain::config::AgentConfig;
use el_node_sdk::{CommandDispatchTable, MessageKind};

use crate::backend::{Capabilities, ProcessLauncher};

/// Build the dispatch table for this host.
pub fn build_table(
    cfg: &AgentConfig,
    caps: Capabilities,
    launcher: Arc<dyn ProcessLauncher>,
    version: &str,
) -> CommandDispatchTable {
    let mut table = CommandDispatchTable::new();

    if caps.exec {
        table.register(MessageKind::Exec, exec::Exec::new(launcher));
    }
    if caps.logs {
        if let Some(root) = &cfg.logs_root {
            table.register(MessageKind::Logs, logs::Logs::new(root.clone()));
        }
    }
    if caps.port_forward {
        table.register(MessageKind::PortForward, port_forward::PortForward);
    }
    table
        .register(
            MessageKind::Info,
            info::Info::new(cfg.node_id.clone(), version, caps.names()),
        )
        .register(MessageKind::Echo, echo::Echo);

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ShellLauncher;

    #[test]
    fn table_matches_capabilities() {
        let caps = Capabilities {
            exec: true,
            logs: false,
            port_forward: true,
        };
        let table = build_table(&AgentConfig::default(), caps, Arc::new(ShellLauncher), "0.1.0");
        assert_eq!(table.capabilities(), caps.names());
        assert!(!table.contains(MessageKind::Attach));
        assert!(!table.contains(MessageKind::Metrics));
    }

    #[test]
    fn minimal_host_keeps_info_and_echo() {
        let table = build_table(
            &AgentConfig::default(),
            Capabilities::default(),
            Arc::new(ShellLauncher),
            "0.1.0",
        );
        assert_eq!(table.kinds(), vec![MessageKind::Info, MessageKind::Echo]);
    }
}
