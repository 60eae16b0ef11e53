mod api;
mod config;
mod credential;
mod ip;
mod provider;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::api::{AppState, ClientConnection};
use crate::provider::azure::AzureDnsClient;
use crate::sync::Synchronizer;

#[derive(Parser, Debug)]
#[command(name = "azure-ddns")]
#[command(about = "A dynamic DNS endpoint backed by an Azure DNS zone")]
struct Args {
    /// Path to the configuration file (environment variables alone are enough)
    #[arg(short, long, env = "DDNS_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration first (before logger init)
    let config = config::Config::load(args.config.as_deref())?;

    // Initialize logger with config log level (env var takes precedence)
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.server.log_level),
    )
    .init();

    if let Some(path) = &args.config {
        info!("Loaded configuration from: {}", path);
    }
    info!(
        "Synchronizing zone {} in resource group {} ({} environment)",
        config.azure.zone_name, config.azure.resource_group_name, config.azure.environment
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.azure.request_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;
    let credential = credential::for_environment(&config.azure, http.clone());
    info!("Using {} credential", credential.name());

    let client = AzureDnsClient::new(
        http,
        credential,
        &config.azure.endpoint,
        &config.azure.subscription_id,
    )?;
    let synchronizer = Synchronizer::new(
        Arc::new(client),
        &config.azure.resource_group_name,
        &config.azure.zone_name,
    );

    let shutdown = CancellationToken::new();
    let app = api::create_router(AppState {
        synchronizer,
        shutdown: shutdown.clone(),
    });

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on http://{}", addr);
    info!("DDNS endpoint: GET /?name={{label}}&ipv4={{address}}&ipv6={{address}}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<ClientConnection>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await
    .context("Server exited with error")?;

    Ok(())
}

/// Waits for Ctrl-C or SIGTERM, then cancels in-flight synchronizations.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
