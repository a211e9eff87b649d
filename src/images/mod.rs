pub mod folder;
pub mod gallery;
pub mod types;

pub use folder::FolderSource;
pub use gallery::GallerySource;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no images available")]
    NoImagesAvailable,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A provider of reply images. `tag` narrows the selection where the source
/// supports it; sources without tag support ignore it.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Pick the next image and return a local path to it.
    async fn next_file(&self, tag: &str) -> Result<PathBuf, SourceError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}
