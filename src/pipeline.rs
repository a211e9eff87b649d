use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::answered::AnsweredPosts;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::feed::FeedPoller;
use crate::images::{FolderSource, GallerySource, ImageSource};
use crate::sender::ReplySender;
use crate::storage::Storage;

/// How long shutdown waits for each loop before abandoning it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The assembled bot: feed poller, dispatcher, sender worker and gallery
/// refill, all hanging off one cancellation token.
pub struct Pipeline {
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Wire everything up and start the loops. Image sources are optional
    /// and independently fallible: one failing its construction is disabled
    /// with an error log while the rest of the pipeline comes up.
    pub async fn start(config: &Config, storage: Arc<dyn Storage>) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let window = Duration::from_secs(config.feed.answered_window_hours * 3600);
        let answered = Arc::new(AnsweredPosts::load(storage.as_ref(), window).await?);

        let mut sources: HashMap<String, Arc<dyn ImageSource>> = HashMap::new();
        if let Some(folder) = &config.folder_source {
            match FolderSource::new(Path::new(&folder.root)) {
                Ok(source) => {
                    sources.insert(folder.command.clone(), Arc::new(source));
                }
                Err(e) => error!(error = format!("{e:#}"), "folder source disabled"),
            }
        }
        if let Some(gallery) = &config.gallery_source {
            match GallerySource::start(gallery, storage.clone(), shutdown.clone()) {
                Ok((source, refill)) => {
                    sources.insert(gallery.command.clone(), source);
                    tasks.push(("gallery refill", refill));
                }
                Err(e) => error!(error = format!("{e:#}"), "gallery source disabled"),
            }
        }
        if sources.is_empty() {
            warn!("no image sources available, every command will be dropped");
        }

        let (sender, worker) = ReplySender::connect(&config.sender, shutdown.clone()).await;
        let sender = Arc::new(sender);
        if let Some(worker) = worker {
            tasks.push(("sender worker", worker));
        }

        let (poller, poll_task) =
            FeedPoller::start(&config.feed, answered.clone(), shutdown.clone())?;
        tasks.push(("feed poller", poll_task));
        let poller = Arc::new(poller);

        let dispatcher = Dispatcher::new(sources, sender, answered, storage);
        tasks.push(("dispatcher", dispatcher.start(poller, shutdown.clone())));

        info!("pipeline running");
        Ok(Self { shutdown, tasks })
    }

    /// Flag cancellation, then give every loop a bounded grace period to
    /// finish its current iteration.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.cancel();
        for (name, task) in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!(task = name, "did not stop within grace period, aborting");
                abort.abort();
            }
        }
        info!("pipeline stopped");
    }
}
