use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use super::{ImageRecord, Storage};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS answered_posts (
    post_id     TEXT PRIMARY KEY,
    answered_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS image_records (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    link  TEXT NOT NULL,
    tag   TEXT NOT NULL DEFAULT '',
    day   TEXT NOT NULL,
    shown INTEGER NOT NULL DEFAULT 0,
    UNIQUE (link, tag, day)
);
CREATE INDEX IF NOT EXISTS idx_image_records_day_tag ON image_records (day, tag);
";

/// Thread-safe SQLite store behind the [`Storage`] trait.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database: {}", path.display()))?;
        // journal_mode returns the resulting mode, so it needs query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)
            .context("failed to run storage migrations")?;
        info!("storage initialized at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn record_answered(&self, post_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO answered_posts (post_id, answered_at) VALUES (?1, ?2)",
            rusqlite::params![post_id, Utc::now().timestamp()],
        )
        .context("failed to record answered post")?;
        Ok(())
    }

    async fn recent_answered_ids(&self, window: Duration) -> Result<HashSet<String>> {
        let cutoff = Utc::now().timestamp() - window.as_secs() as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT post_id FROM answered_posts WHERE answered_at >= ?1")
            .context("failed to prepare answered query")?;
        let ids = stmt
            .query_map(rusqlite::params![cutoff], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()
            .context("failed to read answered posts")?;
        Ok(ids)
    }

    async fn append_image_records(&self, links: &[String], tag: &str, day: NaiveDate) -> Result<()> {
        let day = day.to_string();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for link in links {
            tx.execute(
                "INSERT OR IGNORE INTO image_records (link, tag, day) VALUES (?1, ?2, ?3)",
                rusqlite::params![link, tag, &day],
            )
            .context("failed to append image record")?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn image_records_for(&self, day: NaiveDate, tag: &str) -> Result<Vec<ImageRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, link, shown FROM image_records WHERE day = ?1 AND tag = ?2 ORDER BY id",
            )
            .context("failed to prepare image query")?;
        let records = stmt
            .query_map(rusqlite::params![day.to_string(), tag], |row| {
                Ok(ImageRecord {
                    id: row.get(0)?,
                    link: row.get(1)?,
                    tag: tag.to_string(),
                    day,
                    shown: row.get::<_, i64>(2)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<ImageRecord>>>()
            .context("failed to read image records")?;
        Ok(records)
    }

    async fn mark_image_shown(&self, record: &ImageRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE image_records SET shown = 1 WHERE id = ?1",
            rusqlite::params![record.id],
        )
        .context("failed to mark image shown")?;
        Ok(())
    }
}
