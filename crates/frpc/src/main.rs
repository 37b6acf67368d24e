//! frp client
//!
//! Keeps one control session per configured proxy against the relay and
//! opens work tunnels on demand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use frp_client::{run_proxy, ClientConfig, ProxyClient};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// frpc - connect local services to an frp relay
#[derive(Parser, Debug)]
#[command(name = "frpc")]
#[command(about = "frp client")]
#[command(version)]
struct Args {
    /// Path to the client configuration file
    #[arg(default_value = "./frpc.ini")]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn setup_logging(config: &ClientConfig, override_level: Option<&str>) -> Result<()> {
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

    let config = ClientConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    setup_logging(&config, args.log_level.as_deref())?;

    if config.proxies.is_empty() {
        bail!("no proxies configured in {}", args.config.display());
    }

    let mut sessions = JoinSet::new();
    for proxy in &config.proxies {
        let client = Arc::new(ProxyClient::from(proxy.clone()));
        info!("starting proxy [{}] -> local port {}", client.name, client.local_port);
        sessions.spawn(run_proxy(
            client,
            config.server_addr.clone(),
            config.server_port,
            config.heartbeat_interval,
        ));
    }

    let mut failed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            res = sessions.join_next() => match res {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    error!("proxy session ended: {}", e);
                    failed = true;
                }
                Some(Err(e)) => {
                    error!("proxy task failed: {}", e);
                    failed = true;
                }
                None => {
                    if failed {
                        bail!("all proxy sessions ended with failures");
                    }
                    return Ok(());
                }
            }
        }
    }
}
