//! Tracing subscriber setup for the node binary.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Context;
use el_domain::config::{LogDestination, LogFormat, LoggingConfig};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Install the global subscriber.  `RUST_LOG` overrides `cfg.level`.
pub fn init_tracing(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = env_filter(&cfg.level)?;
    let layer = fmt_layer(cfg)?;

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}")),
    }
}

fn fmt_layer(cfg: &LoggingConfig) -> anyhow::Result<Box<dyn Layer<Registry> + Send + Sync>> {
    let writer = make_writer(cfg)?;
    let ansi = matches!(cfg.format, LogFormat::Pretty | LogFormat::Compact)
        && cfg.destination != LogDestination::File;

    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);
    Ok(match cfg.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    })
}

fn make_writer(cfg: &LoggingConfig) -> anyhow::Result<BoxMakeWriter> {
    Ok(match cfg.destination {
        LogDestination::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogDestination::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogDestination::File => {
            let path = cfg
                .file
                .as_ref()
                .context("logging.destination = \"file\" requires logging.file")?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    })
}
