//! Run events through the analysis oracle and notify the workflow engine about the ones that
//! matter.
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use monitor_common::health::HealthRegistry;
use monitor_common::metrics::{serve, setup_metrics_routes};
use monitor_common::store::{EventStore, PgEventStore};
use monitor_worker::analysis::{AnalysisClient, AnalysisSettings, HttpOracle};
use monitor_worker::circuit_breaker::CircuitBreakerConfig;
use monitor_worker::config::Config;
use monitor_worker::coordinator::{CoordinatorSettings, PipelineCoordinator};
use monitor_worker::dedup::Deduplicator;
use monitor_worker::dispatcher::{DispatchSettings, HttpWorkflowEngine, NotificationDispatcher};
use monitor_worker::ingest::SourcePoller;
use monitor_worker::pipeline::Pipeline;
use monitor_worker::policy::NotificationPolicy;

async fn shutdown_signal() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
    Ok(())
}

pub async fn index() -> &'static str {
    "monitor worker"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;
    config.validate()?;
    let shutdown = CancellationToken::new();

    let liveness = HealthRegistry::new("liveness");
    // Both loops report on every tick: allow a few missed ones.
    let coordinator_liveness = liveness.register(
        "coordinator",
        config.poll_interval.0.max(Duration::from_secs(1)) * 10,
    );
    let recovery_liveness = liveness.register("recovery", config.recovery_interval.0 * 3);

    let store: Arc<dyn EventStore> =
        Arc::new(PgEventStore::new(&config.database_url, config.max_pg_connections).await?);

    let oracle = HttpOracle::new(
        &config.oracle.oracle_url,
        config.oracle.oracle_api_key.clone(),
        config.oracle.oracle_timeout.0,
    )?;
    let analysis = AnalysisClient::new(
        Arc::new(oracle),
        AnalysisSettings {
            timeout: config.oracle.oracle_timeout.0,
            max_retries: config.oracle.oracle_max_retries,
            retry_policy: config.oracle.retry_policy(),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: config.circuit.circuit_failure_threshold,
                failure_window: config.circuit.circuit_failure_window.0,
                open_duration: config.circuit.circuit_open_duration.0,
            },
        },
        shutdown.clone(),
    );

    let engine = HttpWorkflowEngine::new(
        &config.workflow.workflow_url,
        config.workflow.workflow_api_key.clone(),
        config.workflow.workflow_timeout.0,
    )?;
    let dispatcher = NotificationDispatcher::new(
        Arc::new(engine),
        store.clone(),
        DispatchSettings {
            max_attempts: config.workflow.dispatch_max_attempts,
            retry_policy: config.workflow.retry_policy(),
        },
        shutdown.clone(),
    );

    let pipeline = Pipeline::new(
        store.clone(),
        analysis,
        NotificationPolicy::new(
            &config.notification.notify_labels.0,
            config.notification.notify_min_confidence,
        ),
        Deduplicator::in_memory(config.notification.dedup_cooldown.0),
        dispatcher,
    );

    let coordinator = Arc::new(PipelineCoordinator::new(
        Arc::new(pipeline),
        CoordinatorSettings {
            name: config.worker_name.as_str().to_owned(),
            poll_interval: config.poll_interval.0,
            dequeue_batch_size: config.dequeue_batch_size,
            max_concurrent_jobs: config.worker_pool_size(),
            stale_threshold: config.stale_threshold.0,
            recovery_interval: config.recovery_interval.0,
        },
        shutdown.clone(),
    ));

    let poller = if config.sources.monitor_sources.0.is_empty() {
        None
    } else {
        let poller = SourcePoller::new(
            config.sources.monitor_sources.0.clone(),
            store.clone(),
            config.sources.source_poll_interval.0,
            config.sources.source_fetch_timeout.0,
            shutdown.clone(),
        )?;
        let poller_liveness =
            liveness.register("source-poller", config.sources.source_poll_interval.0 * 3);
        Some(tokio::spawn(poller.run(poller_liveness)))
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        );
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();
    let server_shutdown = shutdown.clone().cancelled_owned();
    let server = tokio::spawn(async move { serve(router, &bind, server_shutdown).await });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(error) = shutdown_signal().await {
            tracing::error!("failed to listen for shutdown signals: {}", error);
        }
        signal_token.cancel();
    });

    info!(
        "{} starting with {} workers",
        config.worker_name.as_str(),
        config.worker_pool_size()
    );

    let recovery = coordinator.clone();
    tokio::join!(
        coordinator.run(coordinator_liveness),
        recovery.run_recovery(recovery_liveness),
    );

    if let Some(poller) = poller {
        poller.await?;
    }
    server.await??;
    info!("{} stopped", config.worker_name.as_str());

    Ok(())
}
