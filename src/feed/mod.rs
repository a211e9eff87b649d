pub mod types;

pub use types::{FeedPost, UserCommand};

use anyhow::{Context, Result};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::answered::AnsweredPosts;
use crate::config::FeedConfig;

const COMMAND_QUEUE_SIZE: usize = 64;

/// Polls the feed endpoint and queues the commands found in new posts.
/// Consumers pull them off with [`FeedPoller::next_command`].
pub struct FeedPoller {
    commands: Mutex<mpsc::Receiver<UserCommand>>,
}

impl FeedPoller {
    /// Spawn the poll loop. Returns the poller handle plus the loop's task.
    pub fn start(
        config: &FeedConfig,
        answered: Arc<AnsweredPosts>,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("failed to build feed http client")?;
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let url = config.url.clone();
        let interval = Duration::from_secs(config.poll_interval_s);
        let handle = tokio::spawn(async move {
            poll_loop(client, url, interval, answered, tx, shutdown).await;
        });
        info!("feed poller started");
        Ok((
            Self {
                commands: Mutex::new(rx),
            },
            handle,
        ))
    }

    /// Next queued command, or None once `wait` elapses.
    pub async fn next_command(&self, wait: Duration) -> Option<UserCommand> {
        let mut rx = self.commands.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }
}

async fn poll_loop(
    client: Client,
    url: String,
    interval: Duration,
    answered: Arc<AnsweredPosts>,
    tx: mpsc::Sender<UserCommand>,
    shutdown: CancellationToken,
) {
    loop {
        match fetch_posts(&client, &url).await {
            Ok(posts) => {
                for cmd in commands_from(posts, &answered) {
                    // Blocks when the queue is full: backpressure on the feed
                    if tx.send(cmd).await.is_err() {
                        debug!("command queue closed, stopping poll loop");
                        return;
                    }
                }
            }
            Err(e) => warn!(error = format!("{e:#}"), "feed poll failed"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("feed poll loop stopped");
}

async fn fetch_posts(client: &Client, url: &str) -> Result<Vec<FeedPost>> {
    let resp = client
        .get(url)
        .send()
        .await
        .context("feed request failed")?;
    if !resp.status().is_success() {
        anyhow::bail!("feed returned {}", resp.status());
    }
    let raw = resp.text().await.context("failed to read feed body")?;
    parse_feed(&raw)
}

/// Parse the feed body. A body that is not a JSON array is an error for the
/// whole pass; individual entries that fail to parse are dropped.
pub fn parse_feed(raw: &str) -> Result<Vec<FeedPost>> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(raw).context("feed did not return a JSON array")?;
    let mut posts = Vec::with_capacity(values.len());
    for value in values {
        match serde_json::from_value::<FeedPost>(value) {
            Ok(post) => posts.push(post),
            Err(e) => warn!(error = %e, "dropping malformed feed entry"),
        }
    }
    Ok(posts)
}

/// Unanswered posts, oldest first, reduced to their commands.
fn commands_from(mut posts: Vec<FeedPost>, answered: &AnsweredPosts) -> Vec<UserCommand> {
    posts.sort_by_key(|p| p.date);
    let mut seen = HashSet::new();
    let mut commands = Vec::new();
    for post in posts {
        if answered.contains(&post.count) || !seen.insert(post.count.clone()) {
            continue;
        }
        if let Some(cmd) = extract_command(&post) {
            commands.push(cmd);
        }
    }
    commands
}

/// Recognize a command at the start of a post body.
///
/// A command is a `.` followed by one or more ASCII lowercase letters, at the
/// very start of the body (leading whitespace allowed). The argument is the
/// next whitespace-delimited word, unless that word itself starts with `.`,
/// in which case the argument is empty. Anything further is ignored, so a
/// post carries at most one command.
pub fn extract_command(post: &FeedPost) -> Option<UserCommand> {
    let body = post.body.trim_start();
    let rest = body.strip_prefix('.')?;
    let keyword_len = rest
        .chars()
        .take_while(|c| c.is_ascii_lowercase())
        .count();
    if keyword_len == 0 {
        return None;
    }
    let (keyword, tail) = rest.split_at(keyword_len);
    // The keyword must end at a word boundary: ".randomX" is not a command
    if tail.chars().next().is_some_and(|c| !c.is_whitespace()) {
        return None;
    }
    let argument = tail
        .split_whitespace()
        .next()
        .filter(|t| !t.starts_with('.'))
        .unwrap_or("");
    Some(UserCommand {
        post_id: post.count.clone(),
        keyword: format!(".{keyword}"),
        argument: argument.to_string(),
    })
}
