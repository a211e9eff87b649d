pub mod sqlite;

pub use sqlite::SqliteStorage;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::time::Duration;

/// One harvested gallery image. `day` scopes the pool the record belongs to;
/// `tag` is empty for the default pool.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: i64,
    pub link: String,
    pub tag: String,
    pub day: NaiveDate,
    pub shown: bool,
}

/// Persistence contract for the bot: answered-post dedup across restarts and
/// the gallery image catalog.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist that `post_id` has been answered, stamped now.
    async fn record_answered(&self, post_id: &str) -> Result<()>;

    /// Ids of posts answered within the trailing `window`.
    async fn recent_answered_ids(&self, window: Duration) -> Result<HashSet<String>>;

    /// Append harvested links under `tag` (empty = default pool) and `day`.
    /// Links already recorded for that tag and day are skipped.
    async fn append_image_records(&self, links: &[String], tag: &str, day: NaiveDate) -> Result<()>;

    /// All records for one day and tag, oldest first.
    async fn image_records_for(&self, day: NaiveDate, tag: &str) -> Result<Vec<ImageRecord>>;

    /// Flag a record as shown. Never unset.
    async fn mark_image_shown(&self, record: &ImageRecord) -> Result<()>;
}
