use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SenderConfig;

/// A reply queued for delivery.
#[derive(Debug, Clone)]
pub struct OutboundReply {
    pub post_id: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

/// Delivers replies to the chat endpoint through a single worker, so sends
/// are serialized and paced. A failed session bootstrap leaves the sender
/// permanently disabled instead of failing construction; `send` then errors
/// immediately.
pub struct ReplySender {
    queue: Option<mpsc::Sender<OutboundReply>>,
}

impl ReplySender {
    /// Bootstrap a session and spawn the delivery worker. The session cookie
    /// arrives as a Set-Cookie header on a GET against the base url; the
    /// cookie store carries it into every delivery POST.
    pub async fn connect(
        config: &SenderConfig,
        shutdown: CancellationToken,
    ) -> (Self, Option<JoinHandle<()>>) {
        let client = match build_client(config) {
            Ok(c) => c,
            Err(e) => {
                error!(error = format!("{e:#}"), "sender client setup failed, sender disabled");
                return (Self { queue: None }, None);
            }
        };
        if let Err(e) = bootstrap_session(&client, &config.base_url).await {
            error!(error = format!("{e:#}"), "session bootstrap failed, sender disabled");
            return (Self { queue: None }, None);
        }
        info!("sender ready");

        let (tx, rx) = mpsc::channel(config.queue_size);
        let worker = Worker {
            client,
            post_url: config.post_url.clone(),
            display_name: config.display_name.clone(),
            min_interval: Duration::from_millis(config.min_send_interval_ms),
        };
        let handle = tokio::spawn(worker.run(rx, shutdown));
        (Self { queue: Some(tx) }, Some(handle))
    }

    pub fn is_ready(&self) -> bool {
        self.queue.is_some()
    }

    /// Queue a reply for delivery. Fails fast when the sender is disabled or
    /// already shut down; waits when the queue is merely full.
    pub async fn send(&self, reply: OutboundReply) -> Result<()> {
        let Some(queue) = &self.queue else {
            anyhow::bail!("sender is disabled");
        };
        queue
            .send(reply)
            .await
            .map_err(|_| anyhow::anyhow!("sender worker stopped"))
    }
}

fn build_client(config: &SenderConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0)"),
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
    headers.insert(
        REFERER,
        HeaderValue::from_str(&config.base_url).context("base_url is not a valid referer")?,
    );
    Client::builder()
        .default_headers(headers)
        .cookie_store(true)
        .gzip(true)
        .deflate(true)
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .build()
        .context("failed to build sender http client")
}

async fn bootstrap_session(client: &Client, base_url: &str) -> Result<()> {
    let resp = client
        .get(base_url)
        .send()
        .await
        .context("bootstrap request failed")?;
    if !resp.status().is_success() {
        anyhow::bail!("bootstrap returned {}", resp.status());
    }
    if !resp.headers().contains_key(reqwest::header::SET_COOKIE) {
        anyhow::bail!("bootstrap response carried no session cookie");
    }
    Ok(())
}

struct Worker {
    client: Client,
    post_url: String,
    display_name: String,
    min_interval: Duration,
}

impl Worker {
    async fn run(self, mut queue: mpsc::Receiver<OutboundReply>, shutdown: CancellationToken) {
        let mut last_attempt: Option<Instant> = None;
        loop {
            let reply = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Some(r) => r,
                    None => break,
                },
            };
            // Pace: two attempts never start closer than min_interval apart
            if let Some(last) = last_attempt {
                let since = last.elapsed();
                if since < self.min_interval {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.min_interval - since) => {}
                    }
                }
            }
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.deliver(&reply) => res,
            };
            last_attempt = Some(Instant::now());
            match outcome {
                Ok(()) => info!(post = %reply.post_id, "reply delivered"),
                Err(e) => {
                    warn!(post = %reply.post_id, error = format!("{e:#}"), "reply delivery failed")
                }
            }
        }
        debug!("sender worker stopped");
    }

    async fn deliver(&self, reply: &OutboundReply) -> Result<()> {
        let mut form = Form::new()
            .text("name", self.display_name.clone())
            .text("convo", String::new())
            .text("body", reply.body.clone());
        if let Some(path) = &reply.attachment {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read attachment {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            let part = Part::bytes(bytes)
                .file_name(file_name)
                .mime_str(mime.as_ref())
                .context("attachment mime type rejected")?;
            form = form.part("image", part);
        }
        let resp = self
            .client
            .post(&self.post_url)
            .multipart(form)
            .send()
            .await
            .context("delivery request failed")?;
        let status = resp.status();
        // Drain the (possibly compressed) body before judging the status
        let _ = resp.text().await;
        if !status.is_success() {
            anyhow::bail!("delivery endpoint returned {}", status);
        }
        Ok(())
    }
}
