mod coap;
mod errors;
mod metrics;
mod payload_log;

use axum::{routing::get, Router};
use clap::Parser;
use coap::CoapServer;
use payload_log::{LogRotation, PayloadLog};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "collector", version, about = "CoAP receiver for simulated telemetry")]
struct Config {
    #[arg(long, env = "COAP_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "COAP_PORT", default_value_t = 5683)]
    port: u16,

    /// Resource path telemetry is POSTed to
    #[arg(long, env = "COAP_PATH", default_value = "telemetry")]
    path: String,

    /// Directory the rotated payload files are written to
    #[arg(long, env = "DATA_DIR", default_value = "coap-data")]
    data_dir: PathBuf,

    #[arg(long, env = "ROTATION", value_enum, default_value_t = LogRotation::Minutely)]
    rotation: LogRotation,

    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting CoAP collector");
    info!("Resource: /{}, data dir: {}", config.path, config.data_dir.display());

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let prefix = config.path.trim_matches('/').replace('/', "_");
    let log = match PayloadLog::open(&config.data_dir, &prefix, config.rotation) {
        Ok(log) => log,
        Err(e) => {
            error!("Failed to open payload log: {}", e);
            std::process::exit(1);
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let server = match CoapServer::bind(&addr, &config.path, log).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("CoAP server failed: {}", e);
        }
    });

    let metrics_handle = tokio::spawn(serve_metrics(config.metrics_addr));

    tokio::select! {
        _ = server_handle => {
            error!("CoAP server terminated");
        }
        _ = metrics_handle => {
            error!("Metrics server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

/// Serves `/metrics` when an address is configured, otherwise never returns.
async fn serve_metrics(addr: Option<String>) {
    let Some(addr) = addr else {
        return std::future::pending().await;
    };

    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    info!("Metrics server listening on {}", addr);
    axum::serve(listener, app).await.unwrap_or_else(|e| {
        error!("Metrics server error: {}", e);
    });
}

async fn metrics_handler() -> String {
    metrics::gather_metrics().unwrap_or_else(|e| {
        error!("Failed to encode metrics: {}", e);
        String::new()
    })
}
