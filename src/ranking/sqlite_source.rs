use super::{ContentItem, ContentSource, InteractionSource};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Read-only adapter over the content database.
///
/// Expects a `published_articles(id, title, updated_at)` table with `updated_at`
/// in unix milliseconds, and an `interactions(biz, biz_id, like_cnt)` table.
pub struct SqliteContentSource {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteContentSource {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open content database at {:?}", path))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

impl ContentSource for SqliteContentSource {
    fn list(&self, offset: usize, limit: usize, as_of: DateTime<Utc>) -> Result<Vec<ContentItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, title, updated_at FROM published_articles
             WHERE updated_at <= ?1
             ORDER BY updated_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let items = stmt
            .query_map(
                params![as_of.timestamp_millis(), limit as i64, offset as i64],
                |row| {
                    Ok(ContentItem {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        updated_at: DateTime::from_timestamp_millis(row.get(2)?)
                            .unwrap_or_default(),
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }
}

impl InteractionSource for SqliteContentSource {
    fn like_counts(&self, biz: &str, ids: &[i64]) -> Result<HashMap<i64, i64>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT biz_id, like_cnt FROM interactions WHERE biz = ? AND biz_id IN ({})",
            placeholders
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let args = std::iter::once(rusqlite::types::Value::from(biz.to_string()))
            .chain(ids.iter().map(|&id| rusqlite::types::Value::from(id)));
        let counts = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(counts)
    }
}
