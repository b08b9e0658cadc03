use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use cloudpilot::cloud::{CloudApi, GatewayCloud, SimulatedCloud};
use cloudpilot::config::{Config, ProviderMode, StoreKind};
use cloudpilot::db::{ActionStore, MemoryStore, PgStore};
use cloudpilot::engine::PolicyTable;
use cloudpilot::state::{AppState, Backends};
use cloudpilot::terraform::{CliRunner, DirectoryTemplates};
use cloudpilot::worker::WorkerPool;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = Config::from_env().expect("Failed to load configuration");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(&config.log_level)
        }))
        .init();

    tracing::info!("Starting Cloudpilot");

    let store: Arc<dyn ActionStore> = match config.store {
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .expect("DATABASE_URL is required for the postgres store");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("Failed to connect to database");

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations");
            tracing::info!("Migrations applied");

            Arc::new(PgStore::new(pool))
        }
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let cloud: Arc<dyn CloudApi> = match config.providers.mode {
        ProviderMode::Simulated => {
            tracing::warn!("Provider mode is simulated; no real cloud is touched");
            Arc::new(SimulatedCloud::new())
        }
        ProviderMode::Gateway => Arc::new(
            GatewayCloud::new(
                config.providers.gateways.iter().cloned().collect(),
                config.execution.apply_timeout,
            )
            .expect("Failed to build provider gateway client"),
        ),
    };

    let policy = match &config.policy_file {
        Some(path) => PolicyTable::from_file(path).expect("Failed to load approval policy"),
        None => PolicyTable::default(),
    };

    let pool = WorkerPool::start(config.scheduler.worker_count);
    let backends = Backends {
        store,
        cloud,
        terraform_runner: Arc::new(CliRunner::new(config.terraform.binary.clone())),
        templates: Arc::new(DirectoryTemplates::new(config.terraform.templates.clone())),
        policy,
    };

    let addr = SocketAddr::new(config.host, config.port);
    let state = AppState::new(config, backends, pool.handle()).expect("Failed to build engine");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    pool.spawn_loops(&state, shutdown_rx);

    let app = cloudpilot::build_app(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let drain_state = state.clone();
    tokio::task::spawn_blocking(move || pool.shutdown(&drain_state, Duration::from_secs(30)))
        .await?;

    Ok(())
}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
