//! Job worker process: resolves, merges and harvests taxa from the job queue.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taxa_core::{CancellationSignal, OccurrenceRepository, RegistryClient, SiteRepository, TaxonRepository};
use taxa_db::{Database, PoolConfig};
use taxa_engine::{HarvestConfig, HarvestPipeline, MergeEngine, Resolver, ResolverConfig};
use taxa_jobs::{
    HarvestOccurrencesHandler, JobWorker, MergeDuplicatesHandler, ResolveTaxonHandler,
    ResyncParentHandler, ResyncSynonymHandler, WorkerConfig,
};
use taxa_registry::GbifClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
    //   RUST_LOG    - standard env filter (default: info for every taxa crate)
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "taxa_worker=info,taxa_jobs=info,taxa_engine=info,taxa_registry=info,taxa_db=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("taxa-worker.log");
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
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(non_blocking),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let worker_config = WorkerConfig::from_env();
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let pool_config = PoolConfig::from_env().for_worker_slots(worker_config.max_concurrent_jobs);
    let db = Database::connect_with_config(&database_url, pool_config)
        .await
        .context("connecting to database")?;
    #[cfg(feature = "migrations")]
    db.migrate().await.context("running migrations")?;

    let registry: Arc<dyn RegistryClient> =
        Arc::new(GbifClient::from_env().context("building registry client")?);
    let taxa: Arc<dyn TaxonRepository> = Arc::new(db.taxa.clone());
    let sites: Arc<dyn SiteRepository> = Arc::new(db.sites.clone());
    let occurrences: Arc<dyn OccurrenceRepository> = Arc::new(db.occurrences.clone());
    let cancellation: Arc<dyn CancellationSignal> = Arc::new(db.jobs.clone());

    let resolver = Resolver::new(taxa.clone(), registry.clone(), ResolverConfig::from_env());
    let merge = MergeEngine::new(taxa.clone(), registry.clone());
    let pipeline = HarvestPipeline::new(registry, sites, occurrences, HarvestConfig::from_env());

    let worker = JobWorker::new(Arc::new(db.jobs.clone()), worker_config)
        .with_handler(ResolveTaxonHandler::new(taxa.clone(), resolver.clone()))
        .with_handler(MergeDuplicatesHandler::new(merge))
        .with_handler(ResyncParentHandler::new(taxa.clone(), resolver.clone()))
        .with_handler(ResyncSynonymHandler::new(taxa.clone(), resolver))
        .with_handler(HarvestOccurrencesHandler::new(taxa, pipeline, cancellation))
        .with_wake(db.jobs.job_notify());
    let pending = worker.pending_count().await.unwrap_or_default();
    info!(pending, "Starting job worker");

    let handle = worker.spawn();
    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("Shutdown requested, waiting for running jobs");

    handle.shutdown().await.context("stopping worker")?;
    info!("Worker shut down");
    Ok(())
}
