//! Tracerelay trace delivery service.
//!
//! Listens for newly ingested traces, fans them out to destinations and runs
//! the retry and expiry sweepers until a shutdown signal arrives.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use config::{Config, SandboxKind};
use sqlx::postgres::{PgListener, PgPoolOptions};
use tracerelay_core::{
    storage::Storage, MulticastEventHandler, RealClock, TraceId, TracingEventHandler,
};
use tracerelay_delivery::{
    adapter::{AdapterRegistry, HttpClient},
    storage::PostgresDeliveryStorage,
    DeliveryEngine, DeliveryError, IngestHandle, Orchestrator,
};
use tracing::{debug, error, info, warn};

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);
const LISTENER_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_filter)?;

    info!("starting tracerelay");
    info!(
        database_url = %config.database_url_masked(),
        ingest_workers = config.ingest_workers,
        transform_sandbox = ?config.transform_sandbox,
        encrypted_configs = config.config_encryption_key.is_some(),
        "configuration loaded"
    );

    if config.transform_sandbox == SandboxKind::Process {
        config.confinement().verify().context("process transforms cannot be confined")?;
    }

    let pool = create_database_pool(&config).await?;
    let storage = Arc::new(Storage::new(pool.clone()));
    storage.health_check().await.context("database health check failed")?;
    storage.migrate().await.context("failed to apply database schema")?;
    info!("database ready");

    let orchestrator = build_orchestrator(&config, storage)?;
    let mut engine = DeliveryEngine::new(orchestrator, config.to_engine_config());
    let handle = engine.ingest_handle();
    engine.start().await.context("failed to start delivery engine")?;

    let listener =
        tokio::spawn(listen_for_traces(pool.clone(), config.notify_channel.clone(), handle));
    info!(channel = %config.notify_channel, "tracerelay is ready");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    listener.abort();
    let stats = engine.stats().await;
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not shut down cleanly");
    }
    info!(
        traces_ingested = stats.traces_ingested,
        delivered = stats.delivered,
        failed = stats.failed,
        "delivery engine stopped"
    );

    pool.close().await;
    info!("tracerelay shutdown complete");
    Ok(())
}

fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

fn build_orchestrator(config: &Config, storage: Arc<Storage>) -> Result<Orchestrator> {
    let client =
        HttpClient::new(&config.to_client_config()).context("failed to build HTTP client")?;
    let adapters = AdapterRegistry::with_defaults(client);
    info!(providers = ?adapters.provider_types(), "adapters registered");

    let mut events = MulticastEventHandler::new();
    events.add_subscriber(Arc::new(TracingEventHandler));

    Ok(Orchestrator::new(
        Arc::new(PostgresDeliveryStorage::new(storage)),
        adapters,
        Arc::new(RealClock::new()),
    )
    .with_config(config.to_orchestrator_config())
    .with_transforms(config.transform_executor()?)
    .with_decryptor(config.decryptor()?)
    .with_event_handler(Arc::new(events)))
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_acquire_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Forwards `NOTIFY <channel>, '<trace uuid>'` payloads to the engine.
///
/// Reconnects on listener failure. Returns once the engine stops accepting
/// traces.
async fn listen_for_traces(pool: sqlx::PgPool, channel: String, handle: IngestHandle) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "failed to connect trace listener");
                tokio::time::sleep(LISTENER_RECONNECT_DELAY).await;
                continue;
            },
        };
        if let Err(e) = listener.listen(&channel).await {
            error!(channel = %channel, error = %e, "failed to listen for traces");
            tokio::time::sleep(LISTENER_RECONNECT_DELAY).await;
            continue;
        }
        info!(channel = %channel, "listening for ingested traces");

        loop {
            let notification = match listener.recv().await {
                Ok(notification) => notification,
                Err(e) => {
                    warn!(error = %e, "trace listener failed, reconnecting");
                    break;
                },
            };

            let trace_id = match uuid::Uuid::parse_str(notification.payload().trim()) {
                Ok(uuid) => TraceId::from(uuid),
                Err(e) => {
                    let payload = notification.payload();
                    warn!(payload, error = %e, "ignoring malformed trace id");
                    continue;
                },
            };

            if !submit(&handle, trace_id).await {
                info!("engine stopped accepting traces, listener exiting");
                return;
            }
        }

        tokio::time::sleep(LISTENER_RECONNECT_DELAY).await;
    }
}

/// Submits a trace, waiting while the ingest queue is full. Returns false
/// once the engine is shutting down.
async fn submit(handle: &IngestHandle, trace_id: TraceId) -> bool {
    loop {
        match handle.submit(trace_id) {
            Ok(()) => {
                debug!(trace_id = %trace_id, "trace submitted");
                return true;
            },
            Err(DeliveryError::QueueFull) => tokio::time::sleep(QUEUE_FULL_BACKOFF).await,
            Err(e) => {
                debug!(trace_id = %trace_id, error = %e, "trace not submitted");
                return false;
            },
        }
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
