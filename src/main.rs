use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use api_mutator::config::{CliArgs, MutatorConfig};
use api_mutator::db::Database;
use api_mutator::orchestrator::{worker, Orchestrator};
use api_mutator::server;
use api_mutator::settings::load_validation_defaults;
use api_mutator::state::AppState;
use api_mutator::values::ValueSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref());

    info!("Starting api-mutator v{}", env!("CARGO_PKG_VERSION"));
    let config = MutatorConfig::from_args(args);
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }
    info!("Database: {:?}", config.database_path);
    info!(
        "Workers: {} ({} consumers per run, {})",
        config.worker_count,
        config.consumer_count,
        if config.polling { "polling" } else { "notified" }
    );
    if config.dry_run {
        warn!("Dry run: tests are generated but never executed");
    }

    let values = match ValueSource::from_manifest(&config.values_manifest) {
        Ok(values) => values,
        Err(e) => {
            error!("Could not load test values from {:?}: {:#}", config.values_manifest, e);
            std::process::exit(1);
        }
    };
    if values.is_empty() {
        warn!("Test value manifest {:?} lists no values", config.values_manifest);
    }
    let validation_defaults = load_validation_defaults(&config.validator_config);

    let db = Arc::new(Database::open(&config.database_path)?);
    let config = Arc::new(config);
    let port = config.port;

    let (state, run_rx) = AppState::new(config.clone(), db.clone());
    let state = Arc::new(state);

    let orchestrator = Arc::new(Orchestrator::new(
        db,
        config,
        Arc::new(values),
        validation_defaults,
    )?);
    let workers = worker::spawn_workers(orchestrator, run_rx, state.shutdown_receiver());

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Intake listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Intake stopped, waiting for workers");
    state.shutdown();
    for handle in futures::future::join_all(workers).await {
        if let Err(e) = handle {
            warn!("Worker task ended abnormally: {}", e);
        }
    }
    info!("api-mutator shut down");
    Ok(())
}

/// Stdout plus, with `--log-dir`, a daily rolling file. The returned guard
/// flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "api_mutator=info,tower_http=info".into());

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "api-mutator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
