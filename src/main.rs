//! s3gate - authorizing, re-signing reverse proxy for S3-compatible storage

use clap::Parser;
use s3gate::api::{self, AppState};
use s3gate::config::{
    add_client_to_file, generate_access_key_id, generate_secret_access_key, ClientConfig, Config,
    ProxyMode,
};
use s3gate::sigv4::SignFile;
use s3gate::types::{AccessLevel, Rights};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// s3gate - per-client credentials and capability tokens in front of S3
#[derive(Parser, Debug)]
#[command(name = "s3gate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Authentication mode, `s3` or `web` (overrides config)
    #[arg(short, long, value_name = "MODE")]
    mode: Option<ProxyMode>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Generate an access key pair and add it to the config file
    #[arg(long, value_name = "ID", num_args = 0..=1, requires = "config")]
    generate_key: Option<Option<String>>,

    /// With --generate-key: grant access to every bucket
    #[arg(long, requires = "generate_key")]
    grant_all: bool,

    /// With --generate-key: grant read access to a bucket (repeatable)
    #[arg(long, value_name = "BUCKET", requires = "generate_key")]
    bucket_r: Vec<String>,

    /// With --generate-key: grant read-write access to a bucket (repeatable)
    #[arg(long, value_name = "BUCKET", requires = "generate_key")]
    bucket_rw: Vec<String>,

    /// Sign the request described in a JSON file and print the headers
    #[arg(long, value_name = "REQUEST_JSON")]
    sign: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(path) = &cli.sign {
        return sign_request(path);
    }
    if let Some(id) = &cli.generate_key {
        let path = cli.config.as_deref().ok_or("--generate-key needs --config")?;
        return generate_key(path, id.clone(), &cli);
    }

    let (mut config, source) = Config::load(cli.config.as_deref())?;

    // CLI overrides
    if let Some(addr) = cli.listen {
        config.listen_addr = addr;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }

    let log_level = if cli.verbose {
        "s3gate=trace,tower_http=debug".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting s3gate v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("S3GATE_BUILD_TIME")
    );
    match &source {
        Some(path) => info!("  Config: {}", path.display()),
        None => info!("  Config: environment"),
    }
    info!("  Listen address: {}", config.listen_addr);
    info!("  Public host: {}:{}", config.hostname, config.public_port());
    info!("  Mode: {}", config.mode);
    if let Some(backend) = config.backend.as_ref().and_then(|b| b.target.as_deref()) {
        info!("  Default backend: {}", backend);
    }
    for (bucket, target) in &config.buckets {
        info!(
            "  Bucket {}: {}",
            bucket,
            target.target.as_deref().unwrap_or("(default backend)")
        );
    }
    info!("  API clients: {}", config.clients.len());
    if config.anonymous.is_some() {
        warn!("  Anonymous access is enabled");
    }

    let state = Arc::new(AppState::from_config(&config).await?);
    let shutdown = CancellationToken::new();

    if let Some(addr) = config.metrics_addr {
        let listener = TcpListener::bind(addr).await?;
        info!("Metrics on http://{}/metrics", addr);
        let app = api::monitoring_router(state.clone());
        let stop = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
            {
                warn!("Metrics listener failed: {}", e);
            }
        });
    }

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("s3gate listening on http://{}", config.listen_addr);

    let stop = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.cancel();
    });

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn sign_request(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let file: SignFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let headers = file.sign(chrono::Utc::now());
    println!("{}", serde_json::to_string_pretty(&headers)?);
    Ok(())
}

fn generate_key(
    config_path: &Path,
    access_key_id: Option<String>,
    cli: &Cli,
) -> Result<(), Box<dyn std::error::Error>> {
    let access_key_id = access_key_id.unwrap_or_else(generate_access_key_id);
    let secret_access_key = generate_secret_access_key();

    let rights = if cli.grant_all {
        Rights::GrantAll
    } else {
        // A bucket listed with both flags ends up read-only.
        let mut buckets = BTreeMap::new();
        for bucket in &cli.bucket_rw {
            buckets.insert(bucket.clone(), AccessLevel::ReadWrite);
        }
        for bucket in &cli.bucket_r {
            buckets.insert(bucket.clone(), AccessLevel::Read);
        }
        Rights::Buckets(buckets)
    };

    println!("Access Key ID: {}", access_key_id);
    println!("Secret Access Key: {}", secret_access_key);

    add_client_to_file(
        config_path,
        &access_key_id,
        &ClientConfig {
            secret_access_key,
            rights,
        },
    )?;
    println!("\nAdded the key to {}", config_path.display());
    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
