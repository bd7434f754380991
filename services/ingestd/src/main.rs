use ingestd::auth::StaticTokenVerifier;
use ingestd::config::IngestdConfig;
use ingestd::state::AppState;
use sb_core::collab::{ColdStorage, JsonlColdStorage, NoopColdStorage};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = match env::var("INGESTD_CONFIG") {
        Ok(path) => IngestdConfig::load(&PathBuf::from(&path))
            .unwrap_or_else(|e| panic!("failed to load config {path}: {e}")),
        Err(_) => IngestdConfig::default(),
    };
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| config.bind.clone());

    if config.tokens.is_empty() {
        warn!("no auth tokens configured; every join will be refused");
    }
    let verifier =
        StaticTokenVerifier::from_entries(&config.tokens).expect("invalid auth token table");

    let sink: Arc<dyn ColdStorage> = match &config.cold_storage_path {
        Some(path) => Arc::new(
            JsonlColdStorage::open(path)
                .unwrap_or_else(|e| panic!("failed to open cold storage {}: {e}", path.display())),
        ),
        None => Arc::new(NoopColdStorage),
    };

    let state = AppState::new(config.core, Arc::new(verifier), sink);
    let router = ingestd::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "ingestd listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("ingestd shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
