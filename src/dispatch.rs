use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::answered::AnsweredPosts;
use crate::feed::{FeedPoller, UserCommand};
use crate::images::ImageSource;
use crate::sender::{OutboundReply, ReplySender};
use crate::storage::Storage;

/// How long one iteration waits for a command before re-checking shutdown.
const COMMAND_WAIT: Duration = Duration::from_millis(500);

/// Routes commands to image sources and hands finished replies to the
/// sender. Commands with no registered source are dropped without a reply.
pub struct Dispatcher {
    sources: HashMap<String, Arc<dyn ImageSource>>,
    sender: Arc<ReplySender>,
    answered: Arc<AnsweredPosts>,
    storage: Arc<dyn Storage>,
}

impl Dispatcher {
    pub fn new(
        sources: HashMap<String, Arc<dyn ImageSource>>,
        sender: Arc<ReplySender>,
        answered: Arc<AnsweredPosts>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            sources,
            sender,
            answered,
            storage,
        }
    }

    pub fn start(self, poller: Arc<FeedPoller>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let commands: Vec<&String> = self.sources.keys().collect();
            info!(?commands, "dispatcher started");
            loop {
                let cmd = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    cmd = poller.next_command(COMMAND_WAIT) => match cmd {
                        Some(c) => c,
                        None => continue,
                    },
                };
                self.handle_command(cmd).await;
            }
            debug!("dispatcher stopped");
        })
    }

    /// Resolve one command end to end. The post is marked answered only once
    /// the reply has been accepted by the sender; any earlier failure leaves
    /// it unanswered so a later fetch can retry it.
    async fn handle_command(&self, cmd: UserCommand) {
        let Some(source) = self.sources.get(&cmd.keyword) else {
            debug!(keyword = %cmd.keyword, post = %cmd.post_id, "no source for command, dropping");
            return;
        };
        let path = match source.next_file(&cmd.argument).await {
            Ok(p) => p,
            Err(e) => {
                warn!(source = source.name(), post = %cmd.post_id, error = %e, "image source failed");
                return;
            }
        };
        let reply = OutboundReply {
            post_id: cmd.post_id.clone(),
            body: format!(">>{}", cmd.post_id),
            attachment: Some(path),
        };
        if let Err(e) = self.sender.send(reply).await {
            warn!(post = %cmd.post_id, error = format!("{e:#}"), "could not queue reply");
            return;
        }
        self.answered.insert(&cmd.post_id);
        if let Err(e) = self.storage.record_answered(&cmd.post_id).await {
            warn!(post = %cmd.post_id, error = format!("{e:#}"), "failed to persist answered post");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::SourceError;
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use mockito::Server;
    use std::path::PathBuf;

    struct FakeSource {
        path: Option<PathBuf>,
    }

    #[async_trait]
    impl ImageSource for FakeSource {
        async fn next_file(&self, _tag: &str) -> Result<PathBuf, SourceError> {
            self.path.clone().ok_or(SourceError::NoImagesAvailable)
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn command(keyword: &str) -> UserCommand {
        UserCommand {
            post_id: "5".to_string(),
            keyword: keyword.to_string(),
            argument: String::new(),
        }
    }

    fn sender_config(server: &Server) -> crate::config::SenderConfig {
        crate::config::SenderConfig {
            base_url: format!("{}/chat", server.url()),
            post_url: format!("{}/chat/post", server.url()),
            display_name: "bot".to_string(),
            min_send_interval_ms: 10,
            queue_size: 16,
            request_timeout_ms: 5000,
        }
    }

    async fn ready_sender(server: &mut Server) -> (Arc<ReplySender>, CancellationToken) {
        let _boot = server
            .mock("GET", "/chat")
            .with_status(200)
            .with_header("set-cookie", "sid=abc; Path=/")
            .create_async()
            .await;
        let _delivery = server
            .mock("POST", "/chat/post")
            .with_status(200)
            .expect_at_least(0)
            .create_async()
            .await;
        let shutdown = CancellationToken::new();
        let (sender, _worker) = ReplySender::connect(&sender_config(server), shutdown.clone()).await;
        (Arc::new(sender), shutdown)
    }

    fn dispatcher(
        sources: HashMap<String, Arc<dyn ImageSource>>,
        sender: Arc<ReplySender>,
    ) -> (Dispatcher, Arc<AnsweredPosts>, Arc<SqliteStorage>) {
        let answered = Arc::new(AnsweredPosts::empty());
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let d = Dispatcher::new(sources, sender, answered.clone(), storage.clone());
        (d, answered, storage)
    }

    #[tokio::test]
    async fn test_unknown_keyword_is_dropped_silently() {
        let mut server = Server::new_async().await;
        let (sender, _shutdown) = ready_sender(&mut server).await;
        let (d, answered, _) = dispatcher(HashMap::new(), sender);

        d.handle_command(command(".nope")).await;
        assert!(!answered.contains("5"));
    }

    #[tokio::test]
    async fn test_answered_only_after_sender_accepts() {
        let mut server = Server::new_async().await;
        let (sender, _shutdown) = ready_sender(&mut server).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"x").unwrap();

        let mut sources: HashMap<String, Arc<dyn ImageSource>> = HashMap::new();
        sources.insert(
            ".random".to_string(),
            Arc::new(FakeSource { path: Some(path) }),
        );
        let (d, answered, storage) = dispatcher(sources, sender);

        d.handle_command(command(".random")).await;
        assert!(answered.contains("5"));
        let recent = storage
            .recent_answered_ids(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(recent.contains("5"));
    }

    #[tokio::test]
    async fn test_disabled_sender_leaves_post_unanswered() {
        let mut server = Server::new_async().await;
        // No session cookie: sender comes up disabled
        let _boot = server
            .mock("GET", "/chat")
            .with_status(200)
            .create_async()
            .await;
        let (sender, _) =
            ReplySender::connect(&sender_config(&server), CancellationToken::new()).await;
        assert!(!sender.is_ready());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"x").unwrap();

        let mut sources: HashMap<String, Arc<dyn ImageSource>> = HashMap::new();
        sources.insert(
            ".random".to_string(),
            Arc::new(FakeSource { path: Some(path) }),
        );
        let (d, answered, storage) = dispatcher(sources, Arc::new(sender));

        d.handle_command(command(".random")).await;
        assert!(!answered.contains("5"));
        let recent = storage
            .recent_answered_ids(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(!recent.contains("5"));
    }

    #[tokio::test]
    async fn test_source_failure_leaves_post_unanswered() {
        let mut server = Server::new_async().await;
        let (sender, _shutdown) = ready_sender(&mut server).await;

        let mut sources: HashMap<String, Arc<dyn ImageSource>> = HashMap::new();
        sources.insert(".random".to_string(), Arc::new(FakeSource { path: None }));
        let (d, answered, _) = dispatcher(sources, sender);

        d.handle_command(command(".random")).await;
        assert!(!answered.contains("5"));
    }
}
