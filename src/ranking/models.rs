use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A published piece of content as seen by the ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: i64,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

/// One slot of a computed ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub id: i64,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub likes: i64,
    pub score: f64,
}

impl RankedItem {
    pub fn from_content(item: &ContentItem, likes: i64, score: f64) -> Self {
        Self {
            id: item.id,
            title: item.title.clone(),
            updated_at: item.updated_at,
            likes,
            score,
        }
    }
}
