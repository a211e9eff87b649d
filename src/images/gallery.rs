use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rand::Rng;
use reqwest::Client;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{GalleryEntry, GalleryPage};
use super::{ImageSource, SourceError};
use crate::config::GallerySourceConfig;
use crate::storage::{ImageRecord, Storage};

/// Pages of the default catalog walked per refill pass.
const PAGE_BUDGET: u32 = 10;
/// Pages fetched when a tag pool is first requested.
const TAG_PAGE_BUDGET: u32 = 2;
/// Random probes spent looking for a not-yet-shown record before settling.
const SHOWN_PROBE_BUDGET: u32 = 300;

const MEDIA_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "gif", "webp", "mp4", "webm"];

/// Serves images harvested from a remote gallery catalog. A background loop
/// keeps today's default pool topped up; tag pools are fetched on first
/// request. Selected images are downloaded into a local cache and their
/// records flagged shown.
pub struct GallerySource {
    client: Client,
    base_url: String,
    client_id: String,
    tags: Vec<String>,
    pool_floor: usize,
    max_image_bytes: u64,
    cache_dir: PathBuf,
    refill_interval: Duration,
    storage: Arc<dyn Storage>,
    /// Flips to true once the first refill pass has run; untagged requests
    /// wait on it so they never race an unseeded pool.
    ready: watch::Receiver<bool>,
    /// Tags already fetched today. A tag whose catalog yields nothing would
    /// otherwise be re-fetched on every call before the default-pool
    /// fallback.
    fetched_tags: Mutex<HashSet<(NaiveDate, String)>>,
}

impl GallerySource {
    /// Build the source and spawn its refill loop.
    pub fn start(
        config: &GallerySourceConfig,
        storage: Arc<dyn Storage>,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let client_id = config
            .effective_client_id()
            .context("gallery client id missing (set client_id or GALLERY_CLIENT_ID)")?;
        let cache_dir = PathBuf::from(&config.cache_dir);
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;

        let (ready_tx, ready_rx) = watch::channel(false);
        let source = Arc::new(Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id,
            tags: config.tags.clone(),
            pool_floor: config.pool_floor,
            max_image_bytes: config.max_image_bytes,
            cache_dir,
            refill_interval: Duration::from_secs(config.refill_interval_s),
            storage,
            ready: ready_rx,
            fetched_tags: Mutex::new(HashSet::new()),
        });
        let refill = source.clone();
        let handle = tokio::spawn(async move {
            refill.refill_loop(ready_tx, shutdown).await;
        });
        info!(base_url = %source.base_url, "gallery source started");
        Ok((source, handle))
    }

    async fn refill_loop(self: Arc<Self>, ready: watch::Sender<bool>, shutdown: CancellationToken) {
        loop {
            if let Err(e) = self.refill_pass().await {
                warn!(error = format!("{e:#}"), "gallery refill pass failed");
            }
            // First pass is done, successful or not: unblock untagged callers
            ready.send_replace(true);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.refill_interval) => {}
            }
        }
        debug!("gallery refill loop stopped");
    }

    /// Top up today's default pool if it sits below the floor.
    async fn refill_pass(&self) -> Result<()> {
        let today = Utc::now().date_naive();
        let have = self.storage.image_records_for(today, "").await?.len();
        if have >= self.pool_floor {
            debug!(have, "default pool at floor, skipping fetch");
            return Ok(());
        }
        let mut harvested = 0usize;
        for page in 0..PAGE_BUDGET {
            let links = self
                .fetch_page(&format!("gallery/user/time/day/{page}"))
                .await?;
            if links.is_empty() {
                break;
            }
            harvested += links.len();
            self.storage.append_image_records(&links, "", today).await?;
        }
        info!(harvested, "default gallery pool refilled");
        Ok(())
    }

    async fn fetch_tag_pool(&self, tag: &str, day: NaiveDate) -> Result<()> {
        let mut harvested = 0usize;
        for page in 0..TAG_PAGE_BUDGET {
            let links = self
                .fetch_page(&format!("gallery/t/{tag}/time/day/{page}"))
                .await?;
            if links.is_empty() {
                break;
            }
            harvested += links.len();
            self.storage.append_image_records(&links, tag, day).await?;
        }
        info!(tag, harvested, "tag pool fetched");
        Ok(())
    }

    /// One catalog page, reduced to usable links. A non-2xx response or a
    /// payload reporting failure counts as zero results, which ends the
    /// caller's paging for this pass.
    async fn fetch_page(&self, path: &str) -> Result<Vec<String>> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Client-ID {}", self.client_id))
            .send()
            .await
            .context("gallery page request failed")?;
        if !resp.status().is_success() {
            warn!(%url, status = %resp.status(), "gallery page request rejected");
            return Ok(Vec::new());
        }
        let page: GalleryPage = resp
            .json()
            .await
            .context("failed to parse gallery page")?;
        if !page.success {
            warn!(%url, status = page.status, "gallery reported failure");
            return Ok(Vec::new());
        }
        Ok(page
            .data
            .iter()
            .filter_map(|entry| choose_link(entry, self.max_image_bytes))
            .collect())
    }

    /// Whether `next_file` should hit the tag catalog: the tag must be on
    /// the allow list and not yet fetched today. Recording the attempt up
    /// front keeps a zero-result tag from probing the remote again all day.
    fn should_fetch_tag(&self, tag: &str, day: NaiveDate) -> bool {
        if !self.tags.iter().any(|t| t == tag) {
            return false;
        }
        match self.fetched_tags.lock() {
            Ok(mut tried) => tried.insert((day, tag.to_string())),
            Err(_) => false,
        }
    }

    /// Fetch the image behind `link` into the cache, unless it is already
    /// there. The file name is the last path segment of the link.
    async fn download(&self, link: &str) -> Result<PathBuf, SourceError> {
        let path = self.cache_dir.join(filename_from_link(link));
        if path.exists() {
            debug!(file = %path.display(), "image cache hit");
            return Ok(path);
        }
        let resp = self.client.get(link).send().await?.error_for_status()?;
        let bytes = resp.bytes().await?;
        tokio::fs::write(&path, &bytes).await?;
        debug!(file = %path.display(), bytes = bytes.len(), "image downloaded");
        Ok(path)
    }
}

#[async_trait]
impl ImageSource for GallerySource {
    async fn next_file(&self, tag: &str) -> Result<PathBuf, SourceError> {
        if tag.is_empty() {
            // Hold untagged requests until the first refill pass has run
            let mut ready = self.ready.clone();
            ready
                .wait_for(|r| *r)
                .await
                .map_err(|_| SourceError::NoImagesAvailable)?;
        }
        let today = Utc::now().date_naive();
        let mut records = self.storage.image_records_for(today, tag).await?;
        if records.is_empty() && !tag.is_empty() {
            if self.should_fetch_tag(tag, today) {
                if let Err(e) = self.fetch_tag_pool(tag, today).await {
                    warn!(tag, error = format!("{e:#}"), "tag pool fetch failed");
                }
                records = self.storage.image_records_for(today, tag).await?;
            } else {
                debug!(tag, "no fresh tag pool, using default pool");
            }
            if records.is_empty() {
                records = self.storage.image_records_for(today, "").await?;
            }
        }
        if records.is_empty() {
            return Err(SourceError::NoImagesAvailable);
        }
        let pick = choose_record(&records);
        let path = self.download(&pick.link).await?;
        self.storage.mark_image_shown(pick).await?;
        Ok(path)
    }

    fn name(&self) -> &str {
        "gallery"
    }
}

/// Uniform random probes, preferring a record that has not been shown yet.
/// If every probe lands on shown records the last one wins; the pool is
/// never scanned in full.
fn choose_record(records: &[ImageRecord]) -> &ImageRecord {
    let mut rng = rand::thread_rng();
    let mut pick = &records[rng.gen_range(0..records.len())];
    for _ in 0..SHOWN_PROBE_BUDGET {
        if !pick.shown {
            break;
        }
        pick = &records[rng.gen_range(0..records.len())];
    }
    pick
}

/// Pick the usable link out of one catalog entry. Entries with a structured
/// image list yield the first sub-image within the size ceiling, falling back
/// to the entry's own link; bare entries qualify only when their link has a
/// recognizable media extension.
fn choose_link(entry: &GalleryEntry, max_bytes: u64) -> Option<String> {
    if let Some(images) = entry.images.as_deref().filter(|v| !v.is_empty()) {
        if let Some(img) = images.iter().find(|i| i.size <= max_bytes) {
            return Some(img.link.clone());
        }
        return entry.link.clone();
    }
    entry
        .link
        .as_deref()
        .filter(|l| has_media_extension(l))
        .map(str::to_string)
}

fn has_media_extension(link: &str) -> bool {
    match filename_from_link(link).rsplit_once('.') {
        Some((_, ext)) => MEDIA_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)),
        None => false,
    }
}

/// Last path segment of a link, query string and fragment stripped.
fn filename_from_link(link: &str) -> String {
    let tail = link.rsplit('/').next().unwrap_or(link);
    let tail = tail.split(['?', '#']).next().unwrap_or(tail);
    if tail.is_empty() {
        "image".to_string()
    } else {
        tail.to_string()
    }
}
