use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle state of a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for preemption once `next_run_at` has passed.
    Waiting,
    /// Claimed by a scheduler and currently executing.
    Running,
    /// Never scheduled again.
    Paused,
}

impl JobStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            JobStatus::Waiting => 0,
            JobStatus::Running => 1,
            JobStatus::Paused => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(JobStatus::Waiting),
            1 => Some(JobStatus::Running),
            2 => Some(JobStatus::Paused),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
        }
    }
}

/// A schedulable unit of work as persisted by a [`super::JobStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    /// Unique, used for idempotent registration.
    pub name: String,
    /// Key resolved by the executor registry.
    pub executor: String,
    /// Opaque payload handed to the executor.
    pub config: String,
    pub cron_expression: String,
    pub status: JobStatus,
    /// Bumped by every state transition; guards preempt and release.
    pub version: i64,
    pub next_run_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Next fire time of this job's cron expression strictly after `after`.
    ///
    /// `None` means the job should never run again, either because the schedule
    /// is exhausted or because the expression does not parse.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_cron_time(&self.cron_expression, after)
    }
}

/// Definition used to register (or update) a job by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub executor: String,
    #[serde(default)]
    pub config: String,
    pub cron_expression: String,
}

impl NewJob {
    pub fn new(
        name: impl Into<String>,
        executor: impl Into<String>,
        cron_expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            executor: executor.into(),
            config: String::new(),
            cron_expression: cron_expression.into(),
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }
}

/// Parses a six/seven-field cron expression (seconds first) or a named shortcut
/// such as `@hourly`.
pub fn parse_cron(expression: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(expression.trim())
}

pub fn next_cron_time(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_cron(expression).ok()?.after(&after).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn record(cron: &str) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: 1,
            name: "test".to_string(),
            executor: "local".to_string(),
            config: String::new(),
            cron_expression: cron.to_string(),
            status: JobStatus::Waiting,
            version: 0,
            next_run_at: now,
            updated_at: now,
            created_at: now,
        }
    }

    #[test]
    fn test_status_roundtrip_through_integer() {
        for status in [JobStatus::Waiting, JobStatus::Running, JobStatus::Paused] {
            assert_eq!(JobStatus::from_i64(status.as_i64()), Some(status));
        }
        assert_eq!(JobStatus::from_i64(7), None);
    }

    #[test]
    fn test_next_run_every_three_minutes() {
        let job = record("0 */3 * * * *");
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 30).unwrap();

        let next = job.next_run_after(base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 3, 0).unwrap());
    }

    #[test]
    fn test_next_run_with_shortcut() {
        let job = record("@hourly");
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 20, 0).unwrap();

        let next = job.next_run_after(base).unwrap();
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_invalid_expression_has_no_next_run() {
        let job = record("not a cron");
        assert!(job.next_run_after(Utc::now()).is_none());
    }

    #[test]
    fn test_exhausted_schedule_has_no_next_run() {
        // Seven-field form pins the year; nothing fires after it.
        let job = record("0 0 0 1 1 * 2020");
        assert!(job.next_run_after(Utc::now()).is_none());
    }
}
