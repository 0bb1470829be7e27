mod file_config;

pub use file_config::{FileConfig, JobConfig, RankingConfig, SchedulerConfig};

use crate::background_jobs::SchedulerSettings;
use crate::job_store::parse_cron;
use crate::ranking::RankingSettings;
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub content_db: Option<PathBuf>,
    pub metrics_port: u16,
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub content_db: PathBuf,
    pub metrics_port: u16,
    pub log_filter: Option<String>,

    // Feature configs (with defaults)
    pub scheduler: SchedulerSettings,
    pub ranking: RankingJobSettings,
    pub jobs: Vec<JobConfig>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        // Validate db_dir exists
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let content_db = file
            .content_db
            .map(PathBuf::from)
            .or_else(|| cli.content_db.clone())
            .unwrap_or_else(|| db_dir.join("content.db"));

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let scheduler = resolve_scheduler(cli, file.scheduler.unwrap_or_default())?;
        let ranking = resolve_ranking(file.ranking.unwrap_or_default())?;

        let mut names = HashSet::new();
        for job in &file.jobs {
            if !names.insert(job.name.as_str()) {
                bail!("Duplicate job name in config: {}", job.name);
            }
            if let Err(e) = parse_cron(&job.cron) {
                bail!("Invalid cron expression '{}' for job {}: {}", job.cron, job.name, e);
            }
        }

        Ok(Self {
            db_dir,
            content_db,
            metrics_port,
            log_filter: file.log_filter,
            scheduler,
            ranking,
            jobs: file.jobs,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }
}

fn resolve_scheduler(cli: &CliConfig, file: SchedulerConfig) -> Result<SchedulerSettings> {
    let defaults = SchedulerSettings::default();
    let max_concurrent_jobs = file
        .max_concurrent_jobs
        .unwrap_or(if cli.max_concurrent_jobs > 0 {
            cli.max_concurrent_jobs
        } else {
            defaults.max_concurrent_jobs
        });
    if max_concurrent_jobs == 0 {
        bail!("max_concurrent_jobs must be at least 1");
    }

    let stale_after = match file.stale_after_secs {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => defaults.stale_after,
    };
    let heartbeat_interval = file
        .heartbeat_interval_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.heartbeat_interval);
    if heartbeat_interval.is_zero() {
        bail!("heartbeat_interval_secs must be at least 1");
    }
    if let Some(stale_after) = stale_after {
        if heartbeat_interval >= stale_after {
            bail!(
                "heartbeat_interval_secs ({}) must be shorter than stale_after_secs ({})",
                heartbeat_interval.as_secs(),
                stale_after.as_secs()
            );
        }
    }

    Ok(SchedulerSettings {
        max_concurrent_jobs,
        preempt_timeout: file
            .preempt_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.preempt_timeout),
        poll_interval: file
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval),
        poll_jitter: file
            .poll_jitter_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_jitter),
        heartbeat_interval,
        release_timeout: file
            .release_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.release_timeout),
        stale_after,
        shutdown_grace: file
            .shutdown_grace_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_grace),
    })
}

fn resolve_ranking(file: RankingConfig) -> Result<RankingJobSettings> {
    let defaults = RankingJobSettings::default();

    // An explicit empty string turns the cron trigger off.
    let cron = match file.cron {
        Some(expr) if expr.trim().is_empty() => None,
        Some(expr) => Some(expr),
        None => defaults.cron,
    };
    if let Some(expr) = &cron {
        if let Err(e) = parse_cron(expr) {
            bail!("Invalid ranking cron expression '{}': {}", expr, e);
        }
    }

    let ranking = RankingSettings {
        top_n: file.top_n.unwrap_or(defaults.ranking.top_n),
        batch_size: file.batch_size.unwrap_or(defaults.ranking.batch_size),
        horizon: file
            .horizon_days
            .map(chrono::Duration::days)
            .unwrap_or(defaults.ranking.horizon),
        biz: file.biz.unwrap_or(defaults.ranking.biz),
    };
    if ranking.batch_size == 0 {
        bail!("ranking batch_size must be at least 1");
    }

    let lock_ttl = file
        .lock_ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.lock_ttl);
    if lock_ttl < Duration::from_secs(2) {
        bail!("ranking lock_ttl_secs must be at least 2");
    }

    Ok(RankingJobSettings {
        enabled: file.enabled.unwrap_or(defaults.enabled),
        cron,
        ranking,
        lock_key: file.lock_key.unwrap_or(defaults.lock_key),
        lock_ttl,
        lock_retry_interval: file
            .lock_retry_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_retry_interval),
        lock_acquire_timeout: file
            .lock_acquire_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_acquire_timeout),
        run_timeout: file
            .run_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.run_timeout),
        local_cache_ttl: file
            .local_cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.local_cache_ttl),
        shared_cache_ttl: file
            .shared_cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.shared_cache_ttl),
    })
}

#[derive(Debug, Clone)]
pub struct RankingJobSettings {
    pub enabled: bool,
    /// `None` leaves the job to `[[jobs]]` entries with the `ranking` executor.
    pub cron: Option<String>,
    pub ranking: RankingSettings,
    pub lock_key: String,
    pub lock_ttl: Duration,
    pub lock_retry_interval: Duration,
    pub lock_acquire_timeout: Duration,
    pub run_timeout: Duration,
    pub local_cache_ttl: Duration,
    pub shared_cache_ttl: Duration,
}

impl Default for RankingJobSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: Some("0 */3 * * * *".to_string()),
            ranking: RankingSettings::default(),
            lock_key: "lock:cron_job:ranking".to_string(),
            lock_ttl: Duration::from_secs(30),
            lock_retry_interval: Duration::from_millis(100),
            lock_acquire_timeout: Duration::from_secs(1),
            run_timeout: Duration::from_secs(30),
            local_cache_ttl: Duration::from_secs(24 * 60 * 60),
            shared_cache_ttl: Duration::from_secs(10 * 60),
        }
    }
}
