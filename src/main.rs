use anyhow::{Context, Result};
use smartthings_auth::api::create_oauth_router;
use smartthings_auth::config::{load_config, AuthConfig};
use smartthings_auth::credentials::{CredentialStore, LoggingTokenObserver};
use smartthings_auth::{FlowState, OAuthFlowController, RefreshScheduler};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smartthings_auth=info".into()),
        )
        .init();

    info!("SmartThings auth service starting...");

    // Config file is optional; environment overrides apply either way
    let mut config = match std::env::var("SMARTTHINGS_AUTH_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => AuthConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;

    info!(
        credentials_path = %config.storage.path.display(),
        base_url = %config.oauth.base_url,
        poll_interval_secs = config.refresh.poll_interval_seconds,
        expiry_buffer_secs = config.refresh.expiry_buffer_seconds,
        port = config.server.port,
        "Configuration loaded"
    );

    let store = Arc::new(
        CredentialStore::open(&config.storage.path, config.refresh.expiry_buffer())
            .with_observer(Arc::new(LoggingTokenObserver)),
    );
    let controller = Arc::new(OAuthFlowController::from_config(
        &config.oauth,
        Arc::clone(&store),
    ));

    if controller.state() == FlowState::Unauthenticated {
        controller.start_auth_flow();
    }

    let scheduler = RefreshScheduler::new(
        Arc::clone(&store),
        controller.clone(),
        config.refresh.poll_interval(),
    );
    scheduler.start();

    // Start callback listener
    let router = create_oauth_router(Arc::clone(&controller));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .context("Failed to bind callback port")?;
    info!(port = config.server.port, "OAuth callback listener ready");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Callback server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    scheduler.stop();
    info!("SmartThings auth service stopped");

    Ok(())
}
