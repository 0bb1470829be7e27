//! Top-N content ranking by time-decayed popularity.
//!
//! [`BatchRankingService`] scans recently updated content page by page, scores
//! each item from its like count and age, and keeps only the best N in a bounded
//! min-heap. The finished ranking replaces whatever the [`RankingCache`] held.

mod cache;
mod models;
mod service;
mod sqlite_source;

pub use cache::{LocalRankingCache, SqliteRankingCache, TieredRankingCache};
pub use models::{ContentItem, RankedItem};
pub use service::{default_score, BatchRankingService, RankingSettings, ScoreFn};
pub use sqlite_source::SqliteContentSource;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RankingError {
    #[error("Ranking run exceeded its deadline")]
    DeadlineExceeded,
    #[error("Failed to read ranking input: {0}")]
    Source(anyhow::Error),
    #[error("Failed to store ranking: {0}")]
    Cache(anyhow::Error),
}

/// Paginated view over published content.
#[cfg_attr(test, mockall::automock)]
pub trait ContentSource: Send + Sync {
    /// Items updated at or before `as_of`, most recently updated first.
    fn list(&self, offset: usize, limit: usize, as_of: DateTime<Utc>) -> Result<Vec<ContentItem>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait InteractionSource: Send + Sync {
    /// Like counts keyed by content id. Ids without an interaction record are
    /// absent from the map.
    fn like_counts(&self, biz: &str, ids: &[i64]) -> Result<HashMap<i64, i64>>;
}

/// Where finished rankings are published for readers.
pub trait RankingCache: Send + Sync {
    fn set(&self, ranking: &[RankedItem]) -> Result<()>;

    /// Latest unexpired ranking, if any.
    fn get(&self) -> Result<Option<Vec<RankedItem>>>;
}
