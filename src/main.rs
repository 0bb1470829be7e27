use anyhow::{Context, Result};
use clap::Parser;
use jobrank::background_jobs::jobs::{RankingJob, RANKING_JOB_NAME};
use jobrank::background_jobs::{CronRunner, ExecutorRegistry, Scheduler};
use jobrank::config::{AppConfig, CliConfig, FileConfig};
use jobrank::job_store::{JobStore, NewJob, SqliteJobStore};
use jobrank::lock::{LeaseGuard, LockProvider, RetryPolicy, SqliteLockProvider};
use jobrank::ranking::{
    BatchRankingService, LocalRankingCache, SqliteContentSource, SqliteRankingCache,
    TieredRankingCache,
};
use jobrank::server::metrics;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the CLI flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the job store database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// SQLite database with published content and interactions.
    /// Defaults to `<db_dir>/content.db`.
    #[clap(long, value_parser = parse_path)]
    pub content_db: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9092)]
    pub metrics_port: u16,

    /// Maximum number of job bodies running at the same time.
    #[clap(long, default_value_t = 200)]
    pub max_concurrent_jobs: usize,
}

fn init_logging(log_filter: Option<&str>) {
    let filter = match log_filter {
        Some(directives) => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse_lossy(directives),
        None => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .with_env_var("LOG_LEVEL")
            .from_env_lossy(),
    };

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        content_db: cli_args.content_db.clone(),
        metrics_port: cli_args.metrics_port,
        max_concurrent_jobs: cli_args.max_concurrent_jobs,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    init_logging(config.log_filter.as_deref());

    info!("Initializing metrics...");
    metrics::init_metrics();

    let jobs_db_path = config.jobs_db_path();
    info!("Opening job store at {:?}...", jobs_db_path);
    let store = Arc::new(SqliteJobStore::new(&jobs_db_path)?);
    for job in &config.jobs {
        let registered = store.register(
            &NewJob::new(&job.name, &job.executor, &job.cron).with_config(&job.config),
        )?;
        info!(
            "Registered job {} (id {}, executor {}, {})",
            registered.name,
            registered.id,
            registered.executor,
            registered.status.as_str()
        );
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .context("Failed to install signal handler")?;
    }

    let registry = Arc::new(ExecutorRegistry::new());
    let mut cron_runner = CronRunner::new();
    let mut ranking_job = None;

    if config.ranking.enabled {
        let settings = &config.ranking;
        info!("Opening content database at {:?}...", config.content_db);
        let content = Arc::new(SqliteContentSource::open(&config.content_db)?);
        let shared_cache = Arc::new(SqliteRankingCache::new(
            &jobs_db_path,
            settings.shared_cache_ttl,
        )?);
        let cache = Arc::new(TieredRankingCache::new(
            LocalRankingCache::new(settings.local_cache_ttl),
            shared_cache,
        ));
        let service = Arc::new(BatchRankingService::new(
            content.clone(),
            content,
            cache,
            settings.ranking.clone(),
        ));

        let provider: Arc<dyn LockProvider> = Arc::new(SqliteLockProvider::new(&jobs_db_path)?);
        let guard = LeaseGuard::new(
            provider,
            settings.lock_key.clone(),
            settings.lock_ttl,
            RetryPolicy::fixed_interval(settings.lock_retry_interval),
            settings.lock_acquire_timeout,
        );
        let job = Arc::new(RankingJob::new(guard, service, settings.run_timeout));

        registry.register(job.clone());
        if let Some(cron) = &settings.cron {
            cron_runner.add(cron, job.clone())?;
        }
        ranking_job = Some(job);
    }
    if ranking_job.is_none() {
        for job in config.jobs.iter().filter(|j| j.executor == RANKING_JOB_NAME) {
            warn!(
                "Job {} uses the {} executor but ranking is disabled",
                job.name, RANKING_JOB_NAME
            );
        }
    }
    info!("Registered executors: {:?}", registry.names());

    let metrics_port = config.metrics_port;
    let metrics_shutdown = shutdown.clone();
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = metrics::run_metrics_server(metrics_port, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    let scheduler = Scheduler::new(store, registry, config.scheduler.clone());
    let cron_task = tokio::spawn(cron_runner.run(shutdown.clone()));

    scheduler.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = cron_task.await {
        error!("Cron runner task failed: {}", e);
    }
    if let Some(job) = ranking_job {
        job.close().await;
    }
    let _ = metrics_server.await;

    info!("Shutdown complete");
    Ok(())
}
