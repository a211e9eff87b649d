use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ImageSource, SourceError};

/// Serves files from a local directory tree in random order, exhausting the
/// whole pool before any file repeats. When a cycle runs out the next call
/// starts a fresh one over the full pool.
pub struct FolderSource {
    files: Vec<PathBuf>,
    /// Indices not yet served in the current cycle.
    remaining: Mutex<Vec<usize>>,
}

impl FolderSource {
    /// Collect every file under `root`, recursively. An unreadable root is a
    /// construction error; unreadable subtrees are skipped. An empty pool is
    /// allowed and surfaces per call instead.
    pub fn new(root: &Path) -> Result<Self> {
        let files = collect_files(root)?;
        if files.is_empty() {
            warn!(root = %root.display(), "image folder is empty");
        } else {
            info!(root = %root.display(), count = files.len(), "folder source initialized");
        }
        let remaining = (0..files.len()).collect();
        Ok(Self {
            files,
            remaining: Mutex::new(remaining),
        })
    }
}

fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![std::fs::read_dir(root)
        .with_context(|| format!("failed to read image root {}", root.display()))?];
    while let Some(entries) = stack.pop() {
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if path.is_dir() {
                match std::fs::read_dir(&path) {
                    Ok(sub) => stack.push(sub),
                    Err(e) => {
                        warn!(dir = %path.display(), error = %e, "skipping unreadable subdirectory")
                    }
                }
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

#[async_trait]
impl ImageSource for FolderSource {
    async fn next_file(&self, _tag: &str) -> Result<PathBuf, SourceError> {
        if self.files.is_empty() {
            return Err(SourceError::NoImagesAvailable);
        }
        let mut remaining = match self.remaining.lock() {
            Ok(r) => r,
            Err(_) => return Err(SourceError::NoImagesAvailable),
        };
        if remaining.is_empty() {
            debug!(count = self.files.len(), "folder pool exhausted, starting new cycle");
            *remaining = (0..self.files.len()).collect();
        }
        let slot = rand::thread_rng().gen_range(0..remaining.len());
        let idx = remaining.swap_remove(slot);
        Ok(self.files[idx].clone())
    }

    fn name(&self) -> &str {
        "folder"
    }
}
