use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use loki_bridge::{http, Bridge, BridgeConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// HTTP control/status API for the Loki media player, bridged to MQTT
#[derive(Parser, Debug)]
#[command(name = "loki-bridge")]
#[command(version)]
struct Args {
    /// Bind address, overrides the config file
    #[arg(long)]
    host: Option<String>,

    /// HTTP port, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to bridge.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG is used when unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.log_level.as_deref())?;

    let mut config = BridgeConfig::load(args.config.as_deref()).await?;
    if let Some(host) = args.host {
        config.http.host = host;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }

    let addr = format!("{}:{}", config.http.host, config.http.port);
    info!("Loki bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "MQTT broker: {} (topic prefix: {})",
        config.mqtt.broker, config.mqtt.topic_prefix
    );

    let bridge = Bridge::with_rumqttc(config);
    bridge.start().await;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;
    info!("HTTP server: http://{}", addr);

    let served = axum::serve(listener, http::build_router(bridge.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    bridge.close().await;
    served.map_err(|e| eyre!("Server error: {}", e))
}

fn setup(log_level: Option<&str>) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(log_level);
    Ok(())
}

fn setup_logging_env(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}
