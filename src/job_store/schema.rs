//! SQLite schema for the jobs database.
//!
//! The same database file also hosts the lease table used by
//! [`crate::lock::SqliteLockProvider`] and the shared ranking snapshot used by
//! [`crate::ranking::SqliteRankingCache`], so every replica pointed at it shares
//! job ownership, leadership and results.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Jobs
// =============================================================================

/// Timestamps are unix milliseconds so eligibility is a plain integer comparison.
const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("executor", SqlType::Text, non_null = true),
        sqlite_column!("config", SqlType::Text, non_null = true, default_value = Some("''")),
        sqlite_column!("cron_expression", SqlType::Text, non_null = true),
        sqlite_column!("status", SqlType::Integer, non_null = true),
        sqlite_column!("version", SqlType::Integer, non_null = true),
        sqlite_column!("next_run_at", SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", SqlType::Integer, non_null = true),
        sqlite_column!("created_at", SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_jobs_status_next_run", "status, next_run_at")],
};

// =============================================================================
// Version 2 - Distributed leases
// =============================================================================

const LEASES_TABLE_V2: Table = Table {
    name: "leases",
    columns: &[
        sqlite_column!("lease_key", SqlType::Text, is_primary_key = true),
        sqlite_column!("token", SqlType::Text, non_null = true),
        sqlite_column!("expires_at", SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE leases (
            lease_key TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

// =============================================================================
// Version 3 - Shared ranking snapshot
// =============================================================================

const RANKING_CACHE_TABLE_V3: Table = Table {
    name: "ranking_cache",
    columns: &[
        sqlite_column!("cache_key", SqlType::Text, is_primary_key = true),
        sqlite_column!("payload", SqlType::Text, non_null = true),
        sqlite_column!("expires_at", SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

fn migrate_v2_to_v3(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE ranking_cache (
            cache_key TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Version 1: jobs
/// Version 2: leases
/// Version 3: ranking_cache
pub const JOBS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[JOBS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[JOBS_TABLE_V1, LEASES_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
    VersionedSchema {
        version: 3,
        tables: &[JOBS_TABLE_V1, LEASES_TABLE_V2, RANKING_CACHE_TABLE_V3],
        migration: Some(migrate_v2_to_v3),
    },
];
