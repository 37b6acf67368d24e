//! frp relay server
//!
//! Binds the control-plane listener and serves control and work connections
//! for the proxies named in the configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use frp_connection::Listener;
use frp_server::{ControlService, ProxyRegistry, ServerConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// frps - expose services behind NAT through this relay
#[derive(Parser, Debug)]
#[command(name = "frps")]
#[command(about = "frp relay server")]
#[command(version)]
struct Args {
    /// Path to the server configuration file
    #[arg(default_value = "./frps.ini")]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn setup_logging(config: &ServerConfig, override_level: Option<&str>) -> Result<()> {
    let level = override_level.unwrap_or(&config.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {}", level))?;

    if config.log_way == "file" {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
            .with_context(|| format!("failed to open log file {}", config.log_file))?;
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    setup_logging(&config, args.log_level.as_deref())?;

    let registry = Arc::new(
        ProxyRegistry::from_config(&config)
            .with_context(|| format!("invalid configuration in {}", args.config.display()))?,
    );
    let listener = Listener::bind(&config.bind_addr, config.bind_port).with_context(|| {
        format!(
            "failed to bind control plane on {}:{}",
            config.bind_addr, config.bind_port
        )
    })?;

    info!(
        "frps started, control plane on {}:{}, {} proxies configured",
        config.bind_addr,
        config.bind_port,
        registry.len()
    );

    let service = Arc::new(ControlService::new(registry, config.heartbeat_timeout));
    tokio::select! {
        _ = service.run(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
