//! Standalone worker process.
//!
//! Wires the orchestrator to its dependencies from the environment, restores
//! persisted work, runs the worker pool until Ctrl-C and then drains.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conduit_db::Database;
use conduit_jobs::{
    EchoCapability, HttpCapability, JobOrchestrator, OrchestratorConfig, WorkerEvent,
};

/// Parse `CONDUIT_DEPENDENCIES`, e.g. `llm=http://llm:8080/v1/invoke,vectors=echo`.
fn parse_dependencies(list: &str) -> anyhow::Result<Vec<(String, String)>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, target) = pair
                .split_once('=')
                .with_context(|| format!("Expected name=url, got '{}'", pair))?;
            Ok((name.trim().to_string(), target.trim().to_string()))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "conduit_jobs=info,conduit_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conduit_jobs=info,conduit_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("conduit-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = OrchestratorConfig::from_env();
    let mut builder = JobOrchestrator::builder().with_config(config);

    let dependencies = std::env::var("CONDUIT_DEPENDENCIES").unwrap_or_default();
    for (name, target) in parse_dependencies(&dependencies)? {
        if target == "echo" {
            builder = builder.with_capability(EchoCapability::new(&name));
        } else {
            let capability = HttpCapability::new(&name, &target)
                .with_context(|| format!("Failed to build client for '{}'", name))?;
            builder = builder.with_capability(capability);
        }
        info!(subsystem = "jobs", dependency = %name, target = %target, "Registered dependency");
    }

    // Persistence is optional; without DATABASE_URL state lives in memory.
    let database = if std::env::var("DATABASE_URL").is_ok() {
        let db = Database::from_env()
            .await
            .context("Failed to connect to database")?;
        db.migrate().await.context("Failed to run migrations")?;
        builder = builder.with_store(Arc::new(db.jobs.clone()));
        info!(subsystem = "jobs", "Using PostgreSQL job store");
        Some(db)
    } else {
        warn!(subsystem = "jobs", "DATABASE_URL not set, jobs will not survive restarts");
        None
    };

    let orchestrator = builder.build();
    let report = orchestrator.restore().await?;
    info!(
        jobs = report.jobs,
        dead_letters = report.dead_letters,
        "Recovered persisted state"
    );

    let handle = orchestrator.start();

    let mut events = handle.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::BreakerOpened { dependency }) => {
                    warn!(subsystem = "jobs", dependency = %dependency, "Dependency circuit opened");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subsystem = "jobs", skipped, "Event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Some(db) = database {
        let period = Duration::from_secs(
            std::env::var("DB_POOL_STATS_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60)
                .max(1),
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                db.pool_stats().log();
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, draining workers");

    handle.shutdown().await?;
    info!("Worker stopped");
    Ok(())
}
