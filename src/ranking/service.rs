use super::{ContentSource, InteractionSource, RankedItem, RankingCache, RankingError};
use crate::server::metrics;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Scores an item from `(likes, updated_at, now)`. Higher ranks first.
pub type ScoreFn = Arc<dyn Fn(i64, DateTime<Utc>, DateTime<Utc>) -> f64 + Send + Sync>;

/// `(likes - 1) / (age_secs + 2)^1.5`
pub fn default_score(likes: i64, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_secs = (now - updated_at).num_milliseconds().max(0) as f64 / 1000.0;
    (likes - 1) as f64 / (age_secs + 2.0).powf(1.5)
}

#[derive(Debug, Clone)]
pub struct RankingSettings {
    /// Capacity of the ranking.
    pub top_n: usize,
    /// Page size used against the content source.
    pub batch_size: usize,
    /// Scanning stops after a page whose oldest item is older than this.
    pub horizon: chrono::Duration,
    /// Interaction namespace the like counts are read from.
    pub biz: String,
}

impl Default for RankingSettings {
    fn default() -> Self {
        Self {
            top_n: 100,
            batch_size: 100,
            horizon: chrono::Duration::days(7),
            biz: "article".to_string(),
        }
    }
}

struct Scored(RankedItem);

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    // Equal scores rank the smaller id higher.
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .score
            .total_cmp(&other.0.score)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

pub struct BatchRankingService {
    content: Arc<dyn ContentSource>,
    interactions: Arc<dyn InteractionSource>,
    cache: Arc<dyn RankingCache>,
    settings: RankingSettings,
    score: ScoreFn,
}

impl BatchRankingService {
    pub fn new(
        content: Arc<dyn ContentSource>,
        interactions: Arc<dyn InteractionSource>,
        cache: Arc<dyn RankingCache>,
        settings: RankingSettings,
    ) -> Self {
        Self {
            content,
            interactions,
            cache,
            settings,
            score: Arc::new(default_score),
        }
    }

    pub fn with_score_fn(mut self, score: ScoreFn) -> Self {
        self.score = score;
        self
    }

    pub fn settings(&self) -> &RankingSettings {
        &self.settings
    }

    /// Compute the ranking as of `now` and publish it to the cache.
    pub fn refresh(
        &self,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<Vec<RankedItem>, RankingError> {
        let ranking = self.top_n(now, deadline)?;
        self.cache.set(&ranking).map_err(RankingError::Cache)?;
        info!("Published ranking with {} items", ranking.len());
        Ok(ranking)
    }

    /// Best `top_n` items by score, highest first.
    ///
    /// `deadline` is checked before every page; an expired deadline abandons the
    /// scan without touching the cache.
    pub fn top_n(
        &self,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<Vec<RankedItem>, RankingError> {
        let capacity = self.settings.top_n;
        let batch_size = self.settings.batch_size.max(1);
        let horizon_start = now - self.settings.horizon;

        let mut heap: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(capacity + 1);
        if capacity == 0 {
            return Ok(Vec::new());
        }

        let mut offset = 0;
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(RankingError::DeadlineExceeded);
            }

            let page = self
                .content
                .list(offset, batch_size, now)
                .map_err(RankingError::Source)?;
            metrics::record_ranking_page(page.len());
            if page.is_empty() {
                break;
            }

            let ids: Vec<i64> = page.iter().map(|item| item.id).collect();
            let likes = self
                .interactions
                .like_counts(&self.settings.biz, &ids)
                .map_err(RankingError::Source)?;

            for item in &page {
                let Some(&like_count) = likes.get(&item.id) else {
                    continue;
                };
                let score = (self.score)(like_count, item.updated_at, now);
                let candidate = Scored(RankedItem::from_content(item, like_count, score));

                if heap.len() < capacity {
                    heap.push(Reverse(candidate));
                } else if heap
                    .peek()
                    .is_some_and(|Reverse(lowest)| candidate > *lowest)
                {
                    heap.pop();
                    heap.push(Reverse(candidate));
                }
            }

            let reached_horizon = page
                .iter()
                .map(|item| item.updated_at)
                .min()
                .is_some_and(|oldest| oldest < horizon_start);
            if page.len() < batch_size || reached_horizon {
                debug!(
                    "Ranking scan stopped at offset {} (page of {}, horizon reached: {})",
                    offset,
                    page.len(),
                    reached_horizon
                );
                break;
            }
            offset += page.len();
        }

        // Ascending order of Reverse<_> is descending score.
        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(Scored(item))| item)
            .collect())
    }
}
