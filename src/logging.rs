//! Subscriber setup for the `netrecon` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! whoever embeds it.

use anyhow::{bail, Context, Result};
use std::io;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install a compact stderr subscriber. `RUST_LOG` directives, when set, take
/// precedence over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = create_env_filter(level)?;
    let console = fmt::layer()
        .compact()
        .with_writer(io::stderr)
        .with_target(false);

    Registry::default()
        .with(filter)
        .with(console)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

fn parse_level(level: &str) -> Result<Level> {
    Ok(match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        other => bail!("invalid log level: {other}"),
    })
}

fn create_env_filter(level: &str) -> Result<EnvFilter> {
    let filter = EnvFilter::builder()
        .with_default_directive(parse_level(level)?.into())
        .from_env()
        .context("failed to parse RUST_LOG")?
        .add_directive("trust_dns_proto=warn".parse()?)
        .add_directive("trust_dns_resolver=warn".parse()?);
    Ok(filter)
}
