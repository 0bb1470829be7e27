use super::models::{JobRecord, JobStatus, NewJob};
use super::schema::JOBS_VERSIONED_SCHEMAS;
use super::JobStore;
use crate::sqlite_persistence::open_versioned_db;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

const JOB_COLUMNS: &str = "id, name, executor, config, cron_expression, status, version, next_run_at, updated_at, created_at";

pub(crate) fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path.as_ref(), JOBS_VERSIONED_SCHEMAS, "jobs")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
        let status: i64 = row.get("status")?;
        Ok(JobRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            executor: row.get("executor")?,
            config: row.get("config")?,
            cron_expression: row.get("cron_expression")?,
            // Unknown codes are treated as paused so they are never picked up.
            status: JobStatus::from_i64(status).unwrap_or(JobStatus::Paused),
            version: row.get("version")?,
            next_run_at: from_millis(row.get("next_run_at")?),
            updated_at: from_millis(row.get("updated_at")?),
            created_at: from_millis(row.get("created_at")?),
        })
    }

    fn select_by_name(conn: &Connection, name: &str) -> Result<Option<JobRecord>> {
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
                params![name],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }
}

impl JobStore for SqliteJobStore {
    fn register(&self, job: &NewJob) -> Result<JobRecord> {
        let schedule = super::parse_cron(&job.cron_expression)
            .with_context(|| format!("Invalid cron expression for job {}", job.name))?;

        let now = Utc::now();
        let (status, next_run_at) = match schedule.after(&now).next() {
            Some(next) => (JobStatus::Waiting, next),
            None => (JobStatus::Paused, now),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (name, executor, config, cron_expression, status, version, next_run_at, updated_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)
             ON CONFLICT(name) DO UPDATE SET
                executor = excluded.executor,
                config = excluded.config,
                status = CASE
                    WHEN jobs.status = ?8 AND excluded.status = ?9 THEN excluded.status
                    ELSE jobs.status
                END,
                next_run_at = CASE
                    WHEN jobs.status = ?8 AND excluded.status = ?8
                        AND jobs.cron_expression != excluded.cron_expression
                    THEN excluded.next_run_at
                    ELSE jobs.next_run_at
                END,
                cron_expression = excluded.cron_expression,
                updated_at = excluded.updated_at",
            params![
                job.name,
                job.executor,
                job.config,
                job.cron_expression,
                status.as_i64(),
                to_millis(&next_run_at),
                to_millis(&now),
                JobStatus::Waiting.as_i64(),
                JobStatus::Paused.as_i64(),
            ],
        )?;

        Self::select_by_name(&conn, &job.name)?
            .with_context(|| format!("Job {} missing right after registration", job.name))
    }

    fn get(&self, id: i64) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn preempt(&self) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        loop {
            let now = Utc::now();
            let candidate = conn
                .query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs
                         WHERE status = ?1 AND next_run_at <= ?2
                         ORDER BY next_run_at ASC, id ASC LIMIT 1"
                    ),
                    params![JobStatus::Waiting.as_i64(), to_millis(&now)],
                    Self::row_to_job,
                )
                .optional()?;

            let Some(job) = candidate else {
                return Ok(None);
            };

            let updated = conn.execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2, version = version + 1
                 WHERE id = ?3 AND version = ?4",
                params![
                    JobStatus::Running.as_i64(),
                    to_millis(&now),
                    job.id,
                    job.version
                ],
            )?;

            if updated == 0 {
                debug!(
                    "Lost preemption race for job {} (version {}), retrying",
                    job.id, job.version
                );
                continue;
            }

            return Ok(Some(JobRecord {
                status: JobStatus::Running,
                version: job.version + 1,
                updated_at: now,
                ..job
            }));
        }
    }

    fn release(&self, id: i64, version: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2, version = version + 1
             WHERE id = ?3 AND status = ?4 AND version = ?5",
            params![
                JobStatus::Waiting.as_i64(),
                to_millis(&Utc::now()),
                id,
                JobStatus::Running.as_i64(),
                version
            ],
        )?;
        Ok(updated > 0)
    }

    fn heartbeat(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET updated_at = ?1 WHERE id = ?2",
            params![to_millis(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn reschedule(&self, id: i64, next_run_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET next_run_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![to_millis(&next_run_at), to_millis(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn pause(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![JobStatus::Paused.as_i64(), to_millis(&Utc::now()), id],
        )?;
        Ok(())
    }

    fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2, version = version + 1
             WHERE status = ?3 AND updated_at < ?4",
            params![
                JobStatus::Waiting.as_i64(),
                to_millis(&Utc::now()),
                JobStatus::Running.as_i64(),
                to_millis(&older_than)
            ],
        )?;
        Ok(count)
    }
}
