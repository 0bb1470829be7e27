//! Shared constants for integration tests

/// Lease key used by ranking replicas.
#[allow(dead_code)]
pub const RANKING_LOCK_KEY: &str = "lock:cron_job:ranking";

/// Cron expression firing every second.
#[allow(dead_code)]
pub const EVERY_SECOND: &str = "* * * * * *";

/// Cron expression that will not fire again during a test run.
#[allow(dead_code)]
pub const EVERY_THREE_MINUTES: &str = "0 */3 * * * *";
