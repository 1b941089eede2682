use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::adapters::{HttpTransport, PostgresStore};
use crate::api::{create_router, spawn_event_forwarder, AppState};
use crate::config::AppConfig;
use crate::coordinator::{AgentTransport, Orchestrator};
use crate::error::{ConvoyError, Result};
use crate::persistence::open_store;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(version)]
#[command(about = "Agent fleet coordinator: health, placement, envelopes and circuit breaking", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and <CONVOY_ENV>.toml
    #[arg(long, global = true, default_value = "config", env = "CONVOY_CONFIG_DIR")]
    pub config_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator and HTTP API (default)
    Serve {
        /// Override api.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Load, validate and print the effective configuration as JSON
    CheckConfig,
    /// Apply PostgreSQL migrations
    Migrate,
}

/// Run the orchestrator until SIGINT/SIGTERM
pub async fn serve(config: AppConfig) -> Result<()> {
    let store = open_store(&config.persistence).await?;
    let transport: Arc<dyn AgentTransport> =
        Arc::new(HttpTransport::new(config.transport.clone())?);

    let orchestrator = Orchestrator::new(&config, store, transport);
    orchestrator.restore().await?;
    let handle = orchestrator.handle();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let orchestrator_task = tokio::spawn(orchestrator.run(shutdown_tx.subscribe()));

    let api_task = if config.api.enabled {
        let state = AppState::new(handle);
        spawn_event_forwarder(&state, shutdown_tx.subscribe());
        let app = create_router(state);

        let listener = TcpListener::bind(&config.api.bind).await?;
        info!(bind = %config.api.bind, "HTTP API listening");
        let mut api_shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.recv().await;
                })
                .await
        }))
    } else {
        None
    };

    shutdown_signal().await;
    info!("shutdown requested, no longer accepting submissions");
    let _ = shutdown_tx.send(());

    if let Err(e) = orchestrator_task.await {
        error!(error = %e, "orchestrator task failed");
    }
    if let Some(api_task) = api_task {
        match api_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "HTTP API exited with error"),
            Err(e) => error!(error = %e, "HTTP API task failed"),
        }
    }
    info!("convoy stopped");
    Ok(())
}

pub fn check_config(config: &AppConfig) -> Result<()> {
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

pub async fn migrate(config: &AppConfig) -> Result<()> {
    let url = config.persistence.database_url.as_deref().ok_or_else(|| {
        ConvoyError::InvalidConfig("persistence.database_url is not set".into())
    })?;
    let store = PostgresStore::new(url, config.persistence.max_connections).await?;
    store.migrate().await?;
    info!("migrations applied");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
}
