use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

const ENV_FILE: &str = ".env";

/// Environment variable that overrides `[gallery_source].client_id`.
pub const GALLERY_CLIENT_ID_ENV: &str = "GALLERY_CLIENT_ID";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub feed: FeedConfig,
    pub sender: SenderConfig,
    pub storage: StorageConfig,
    pub folder_source: Option<FolderSourceConfig>,
    pub gallery_source: Option<GallerySourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: u64,
    /// Trailing window used to seed the answered-post cache at startup.
    #[serde(default = "default_answered_window")]
    pub answered_window_hours: u64,
    #[serde(default = "default_feed_timeout")]
    pub request_timeout_ms: u64,
}

fn default_poll_interval() -> u64 { 10 }
fn default_answered_window() -> u64 { 24 }
fn default_feed_timeout() -> u64 { 5000 }

#[derive(Debug, Deserialize, Clone)]
pub struct SenderConfig {
    /// Session bootstrap target; the session cookie comes from here.
    pub base_url: String,
    /// Delivery endpoint for the multipart reply POST.
    pub post_url: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_min_send_interval")]
    pub min_send_interval_ms: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_sender_timeout")]
    pub request_timeout_ms: u64,
}

fn default_min_send_interval() -> u64 { 3000 }
fn default_queue_size() -> usize { 64 }
fn default_sender_timeout() -> u64 { 30000 }

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FolderSourceConfig {
    #[serde(default = "default_folder_command")]
    pub command: String,
    pub root: String,
}

fn default_folder_command() -> String {
    ".random".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GallerySourceConfig {
    #[serde(default = "default_gallery_command")]
    pub command: String,
    pub base_url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Tags users may request pools for; anything else falls back to the
    /// default pool without touching the remote API.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Refill stops topping up the default pool once today's count reaches this.
    #[serde(default = "default_pool_floor")]
    pub pool_floor: usize,
    /// Sub-images above this size are passed over during harvesting.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_refill_interval")]
    pub refill_interval_s: u64,
}

fn default_gallery_command() -> String {
    ".imgur".to_string()
}
fn default_pool_floor() -> usize { 500 }
fn default_max_image_bytes() -> u64 { 5_000_000 }
fn default_cache_dir() -> String {
    "imgs".to_string()
}
fn default_refill_interval() -> u64 { 600 }

impl GallerySourceConfig {
    /// Client credential, with the environment variable taking precedence
    /// over the config file.
    pub fn effective_client_id(&self) -> Option<String> {
        match std::env::var(GALLERY_CLIENT_ID_ENV) {
            Ok(v) if !v.is_empty() => Some(v),
            _ => self.client_id.clone().filter(|v| !v.is_empty()),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| "Failed to parse config TOML")?;
        Ok(config)
    }

    /// Load .env file into process environment. Real env vars take precedence.
    pub fn load_env_file() {
        let path = Path::new(ENV_FILE);
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return,
        };
        // Strip BOM if present (common on Windows-created files)
        let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
        for line in content.lines() {
            let line = line.trim().trim_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    std::env::set_var(key, value);
                }
            }
        }
    }
}
