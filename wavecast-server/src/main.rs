//! # Wavecast Server
//!
//! Streaming media server focused on listener admission and on-disk
//! content delivery: per-mount authentication with pluggable back-ends,
//! fallback files served at a target bitrate, and byte-range file serving.

mod connection;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use wavecast_config::ServerConfig;
use wavecast_core::Core;

/// Command line arguments for the Wavecast server
#[derive(Parser, Debug)]
#[command(name = "wavecast")]
#[command(about = "Streaming media server with authenticated mounts and throttled fallback serving")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "WAVECAST_CONFIG", default_value = "wavecast.toml")]
    config: PathBuf,

    /// Override the bind address, eg 127.0.0.1:8000
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    let args = Args::parse();
    let config = if args.config.exists() {
        wavecast_config::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!(
            "config file {} not found, using defaults",
            args.config.display()
        );
        ServerConfig::default()
    };

    let bind = args
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.bind_address, config.port));
    let core = Core::new(config);

    // housekeeping: bandwidth throttle, accept slowdown decay, move budget
    let housekeeper = {
        let core = core.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                core.update_throttle();
                core.decay_slowdown();
                core.shards.replenish();
            }
        })
    };

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!("listening on {bind}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let core = core.clone();
                        tokio::spawn(connection::handle(core, stream, peer.ip().to_string()));
                    }
                    Err(err) => {
                        error!("accept failed: {err}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    housekeeper.abort();
    core.shutdown().await;
    Ok(())
}
