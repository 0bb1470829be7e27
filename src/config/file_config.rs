use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub content_db: Option<String>,
    pub metrics_port: Option<u16>,
    pub log_filter: Option<String>,

    // Feature configs
    pub scheduler: Option<SchedulerConfig>,
    pub ranking: Option<RankingConfig>,
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: Option<usize>,
    pub preempt_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub poll_jitter_ms: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub release_timeout_ms: Option<u64>,
    /// `0` disables reclaiming stale running jobs.
    pub stale_after_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RankingConfig {
    pub enabled: Option<bool>,
    /// Empty string disables the local cron trigger.
    pub cron: Option<String>,
    pub top_n: Option<usize>,
    pub batch_size: Option<usize>,
    pub horizon_days: Option<i64>,
    pub biz: Option<String>,
    pub lock_key: Option<String>,
    pub lock_ttl_secs: Option<u64>,
    pub lock_retry_interval_ms: Option<u64>,
    pub lock_acquire_timeout_ms: Option<u64>,
    pub run_timeout_secs: Option<u64>,
    pub local_cache_ttl_secs: Option<u64>,
    pub shared_cache_ttl_secs: Option<u64>,
}

/// A `[[jobs]]` entry, registered in the job store by name at startup.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    pub executor: String,
    pub cron: String,
    #[serde(default)]
    pub config: String,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_full_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
db_dir = "/data"
metrics_port = 9100
log_filter = "jobrank=debug"

[scheduler]
max_concurrent_jobs = 8
stale_after_secs = 0

[ranking]
cron = ""
top_n = 50

[[jobs]]
name = "ranking-refresh"
executor = "ranking"
cron = "0 */5 * * * *"

[[jobs]]
name = "noop"
executor = "noop"
cron = "@hourly"
config = "{}"
"#,
        )
        .unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.db_dir.as_deref(), Some("/data"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.log_filter.as_deref(), Some("jobrank=debug"));

        let scheduler = config.scheduler.unwrap();
        assert_eq!(scheduler.max_concurrent_jobs, Some(8));
        assert_eq!(scheduler.stale_after_secs, Some(0));
        assert!(scheduler.poll_interval_ms.is_none());

        let ranking = config.ranking.unwrap();
        assert_eq!(ranking.cron.as_deref(), Some(""));
        assert_eq!(ranking.top_n, Some(50));

        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.jobs[0].config, "");
        assert_eq!(config.jobs[1].config, "{}");
    }

    #[test]
    fn test_load_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert!(config.db_dir.is_none());
        assert!(config.scheduler.is_none());
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn test_load_rejects_job_without_executor() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[[jobs]]\nname = \"a\"\ncron = \"@daily\"\n").unwrap();

        assert!(FileConfig::load(&path).is_err());
    }
}
