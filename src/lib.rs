//! Retry DLQ - named job queues with bounded retries and a dead-letter path.
//!
//! This library provides a job service that runs worker pools over a durable
//! job store, and a retry/dead-letter service that maps consumer and producer
//! failure domains onto retry queues.

pub mod cli;
pub mod config;
pub mod error;
pub mod job_service;
pub mod jobs;
pub mod observability;
pub mod retry_dlq;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::cli::{Cli, Commands, DomainArgs};
use crate::config::model::MetricsConfig;
use crate::config::AppConfig;
use crate::job_service::JobService;
use crate::observability::{
    Metrics, MetricsObservability, MetricsServer, ObservabilityService, TracingObservability,
};
use crate::store::{JobStore, RedisStore, StoreConnector};

/// Runs the CLI with the provided arguments.
pub async fn run(cli: Cli) -> Result<()> {
    setup_logging(cli.log_level())?;

    match cli.command {
        Commands::ConfigValidate => validate_config(&cli.config).await,
        Commands::ConfigShow => show_config(&cli.config).await,
        Commands::DlqList(args) => list_dead_letters(&cli.config, &args).await,
        Commands::DlqRevive { domain, job_id } => {
            revive_dead_letter(&cli.config, &domain.domain, &job_id).await
        }
        Commands::Enqueue { domain, payload } => {
            enqueue(&cli.config, &domain.domain, &payload).await
        }
        Commands::QueueStats(args) => queue_stats(&cli.config, &args).await,
        Commands::QueuePause(args) => set_paused(&cli.config, &args, true).await,
        Commands::QueueResume(args) => set_paused(&cli.config, &args, false).await,
    }
}

/// Initializes the tracing subscriber for structured logging.
fn setup_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// A job service wired to Redis, the tracing sink and, when enabled,
/// Prometheus metrics.
pub struct Runtime {
    pub job_service: JobService,
    pub metrics: Option<Arc<Metrics>>,
}

/// Builds the observability chain described by the metrics settings.
pub fn observability(
    config: &MetricsConfig,
) -> Result<(Arc<dyn ObservabilityService>, Option<Arc<Metrics>>)> {
    let tracing_sink: Arc<dyn ObservabilityService> = Arc::new(TracingObservability);
    if !config.enabled {
        return Ok((tracing_sink, None));
    }

    let metrics = Arc::new(Metrics::new()?);
    let sink = Arc::new(MetricsObservability::new(Arc::clone(&metrics), tracing_sink));
    Ok((sink, Some(metrics)))
}

/// Creates a job service from configuration. Starts the metrics server in
/// the background when metrics are enabled.
pub async fn start_runtime(config: &AppConfig) -> Result<Runtime> {
    let connector: Arc<dyn StoreConnector> = Arc::new(RedisStore::from_config(&config.redis)?);
    let (sink, metrics) = observability(&config.metrics)?;

    if let Some(metrics) = &metrics {
        let server = MetricsServer::new(Arc::clone(metrics), config.metrics.port);
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!(error = %e, port, "Prometheus server failed");
            }
        });
    }

    let job_service = JobService::with_worker_defaults(
        connector,
        sink,
        config.job_service.worker_options(),
    );
    info!(domains = config.domains.len(), "Job service runtime ready");

    Ok(Runtime {
        job_service,
        metrics,
    })
}

/// Validates the configuration file and reports any issues.
async fn validate_config(config_path: &Path) -> Result<()> {
    let config = config::loader::load_and_validate(config_path)?;

    println!("Configuration is valid.");
    println!("Found {} domain(s):", config.domains.len());
    for (name, domain) in &config.domains {
        println!(
            "  - {} ({}, attempts: {}, queue: {})",
            name,
            domain.identifier,
            domain.attempts,
            domain.identifier.queue_name()
        );
    }

    Ok(())
}

/// Displays the parsed configuration.
async fn show_config(config_path: &Path) -> Result<()> {
    let config = config::loader::load_and_validate(config_path)?;
    let yaml = serde_yaml::to_string(&config)?;
    println!("{}", yaml);
    Ok(())
}

/// Opens a store connection for a configured domain and returns it with the
/// domain's queue name.
async fn open_domain(config_path: &Path, domain: &str) -> Result<(Arc<dyn JobStore>, String)> {
    let config = config::loader::load_and_validate(config_path)?;
    let queue = config.domain(domain)?.identifier.queue_name();
    let store = RedisStore::from_config(&config.redis)?.connect().await?;
    Ok((store, queue))
}

/// Lists the dead-lettered jobs of a domain.
async fn list_dead_letters(config_path: &Path, args: &DomainArgs) -> Result<()> {
    let (store, queue) = open_domain(config_path, &args.domain).await?;
    let jobs = store.failed(&queue).await?;

    if jobs.is_empty() {
        println!("Dead letter queue '{}' is empty.", queue);
    } else {
        println!("Dead letter queue '{}' ({} jobs):", queue, jobs.len());
        for job in jobs {
            println!(
                "  {} - attempts {}/{} - {} - {}",
                job.id,
                job.attempts_made,
                job.opts.attempts,
                job.stacktrace.last().map(String::as_str).unwrap_or("Unknown error"),
                job.data
            );
        }
    }

    store.disconnect().await?;
    Ok(())
}

/// Moves a dead-lettered job back to its queue.
async fn revive_dead_letter(config_path: &Path, domain: &str, job_id: &str) -> Result<()> {
    let (store, queue) = open_domain(config_path, domain).await?;

    match store.retry(&queue, job_id).await? {
        Some(job) => println!(
            "Job {} moved from dead letter queue back to '{}' ({} attempt(s) made).",
            job.id, queue, job.attempts_made
        ),
        None => anyhow::bail!(error::JobError::JobNotFound {
            queue,
            job_id: job_id.to_string(),
        }),
    }

    store.disconnect().await?;
    Ok(())
}

/// Adds a JSON payload to a domain's retry queue.
async fn enqueue(config_path: &Path, domain: &str, payload: &str) -> Result<()> {
    let config = config::loader::load_and_validate(config_path)?;
    let domain_config = config.domain(domain)?;
    let queue = domain_config.identifier.queue_name();
    let options = domain_config.job_options(config.job_service.stacktrace_limit);

    let data: serde_json::Value = serde_json::from_str(payload)?;
    let store = RedisStore::from_config(&config.redis)?.connect().await?;
    let job = store.add(&queue, data, &options).await?;
    println!("Job {} added to queue '{}'.", job.id, queue);

    store.disconnect().await?;
    Ok(())
}

/// Prints job counts per state for a domain.
async fn queue_stats(config_path: &Path, args: &DomainArgs) -> Result<()> {
    let (store, queue) = open_domain(config_path, &args.domain).await?;
    let counts = store.counts(&queue).await?;
    let paused = store.is_paused(&queue).await?;

    println!("Queue '{}'{}:", queue, if paused { " (paused)" } else { "" });
    println!("  waiting: {}", counts.waiting);
    println!("  delayed: {}", counts.delayed);
    println!("  active:  {}", counts.active);
    println!("  failed:  {}", counts.failed);

    store.disconnect().await?;
    Ok(())
}

/// Pauses or resumes a domain's queue.
async fn set_paused(config_path: &Path, args: &DomainArgs, paused: bool) -> Result<()> {
    let (store, queue) = open_domain(config_path, &args.domain).await?;

    if paused {
        store.pause(&queue).await?;
        println!("Queue '{}' has been paused.", queue);
    } else {
        store.resume(&queue).await?;
        println!("Queue '{}' has been resumed.", queue);
    }

    store.disconnect().await?;
    Ok(())
}
