//! Saga server entry point.

use std::sync::Arc;

use instance_store::{InMemoryInstanceStore, InstanceStore, PostgresInstanceStore};
use saga::{CommandDispatcher, DefinitionRegistry, OrchestratorConfig, SagaEngine};
use saga_server::config::{Config, LogFormat};
use saga_server::error::StartupError;
use saga_server::transport::JsonLinesDispatcher;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Logs go to stderr; stdout carries the command stream.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

async fn connect_store(config: &Config) -> Result<Arc<dyn InstanceStore>, StartupError> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = PostgresInstanceStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL instance store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga instances will not survive a restart");
            Ok(Arc::new(InMemoryInstanceStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Load and validate saga definitions; any error is fatal
    let registry = Arc::new(DefinitionRegistry::load(&config.definitions_path)?);
    tracing::info!(
        path = %config.definitions_path.display(),
        sagas = registry.len(),
        "saga definitions loaded"
    );

    // 4. Wire store, transport and engine
    let store = connect_store(&config).await?;
    let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(JsonLinesDispatcher::stdout());
    let engine = SagaEngine::new(
        store,
        registry,
        dispatcher,
        OrchestratorConfig {
            max_conflict_retries: config.max_conflict_retries,
            ..OrchestratorConfig::default()
        },
    );
    let app = saga_server::create_app(
        saga_server::create_state(engine.orchestrator()),
        metrics_handle,
    );

    // 5. Run the engine until the server stops
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.run_until(async move {
        let _ = stop_rx.changed().await;
    }));

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting saga server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stop_tx.send(true);
        })
        .await?;

    engine_task.await??;
    tracing::info!("server shut down gracefully");
    Ok(())
}
