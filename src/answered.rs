use anyhow::Result;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use crate::storage::Storage;

/// In-memory set of post ids that already got a reply. The feed poller
/// consults it to filter fetched posts; the dispatcher inserts into it once
/// a reply has been handed to the sender.
///
/// Seeded at startup from storage so a restart does not re-answer posts
/// handled within the trailing window.
pub struct AnsweredPosts {
    ids: Mutex<HashSet<String>>,
}

impl AnsweredPosts {
    /// Seed the cache from posts answered within `window`.
    pub async fn load(storage: &dyn Storage, window: Duration) -> Result<Self> {
        let ids = storage.recent_answered_ids(window).await?;
        info!("answered-post cache seeded with {} ids", ids.len());
        Ok(Self {
            ids: Mutex::new(ids),
        })
    }

    /// Empty cache, for tests and storage-less setups.
    pub fn empty() -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn contains(&self, post_id: &str) -> bool {
        match self.ids.lock() {
            Ok(ids) => ids.contains(post_id),
            Err(_) => false,
        }
    }

    /// Returns true if the id was not present before.
    pub fn insert(&self, post_id: &str) -> bool {
        match self.ids.lock() {
            Ok(mut ids) => ids.insert(post_id.to_string()),
            Err(_) => false,
        }
    }
}
