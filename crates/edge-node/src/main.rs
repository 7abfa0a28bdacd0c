use std::sync::Arc;

use clap::Parser;
use el_domain::config::Config;
use el_edge_node::backend::{Capabilities, ShellLauncher};
use el_edge_node::cli::{self, Cli, Command, ConfigCommand};
use el_edge_node::handlers;
use el_node_sdk::{NodeAgent, TransportRegistry};
use el_transports::WebSocketFactory;
use tokio_util::sync::CancellationToken;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = cli::load_config(&cli.config)?;
    cli.apply_overrides(&mut config);

    match cli.command {
        // Default to run when no subcommand is given.
        None | Some(Command::Run) => {
            if !Config::has_errors(&config.validate()) {
                el_edge_node::logging::init_tracing(&config.logging)?;
                return run(config).await;
            }
            cli::config::validate(&config, &cli.config);
            std::process::exit(1);
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            if !cli::config::validate(&config, &cli.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            print!("{}", cli::config::show(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("edgelink-node {VERSION}");
            Ok(())
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    for issue in config.validate() {
        tracing::warn!(%issue, "config warning");
    }

    // ── Host backend and handlers ────────────────────────────────────
    let caps = Capabilities::detect(&config.agent);
    let table = handlers::build_table(&config.agent, caps, Arc::new(ShellLauncher), VERSION);
    tracing::info!(capabilities = ?table.capabilities(), "registered command handlers");

    // ── Transports ───────────────────────────────────────────────────
    let mut transports = TransportRegistry::new();
    transports.register(WebSocketFactory::new(
        config.agent.node_id.clone(),
        VERSION,
        table.capabilities(),
    ));

    let agent = NodeAgent::builder()
        .config(&config.agent)
        .methods(config.connectivity.clone())
        .transports(transports)
        .handlers(table)
        .build()?;

    // ── Run ──────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        signal.cancel();
    });

    tracing::info!(
        node_id = %agent.node_id(),
        transports = ?agent.transport_ids(),
        version = VERSION,
        "starting edgelink-node"
    );

    match agent.run(shutdown).await {
        Ok(()) => {
            tracing::info!("node exited cleanly");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "node exited with error");
            Err(e.into())
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable; Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
