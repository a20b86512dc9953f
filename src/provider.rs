//! Providers: the supply of pending documents for a batch task.
//!
//! A provider hands out one [`Source`], a single consumable queue of paths.
//! Every worker of the batch pulls from the same source; each path reaches
//! exactly one worker, at most once. Closing the producing side is the only
//! termination signal.
//!
//! `tokio::sync::mpsc` receivers are single-consumer, so the receiver sits
//! behind an async mutex that serialises the hand-off between workers. The
//! mutex is held only for one `recv()`; no other state is shared.

use crate::error::Pdf2ImgError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Buffer size of the channel fed by [`from_dir_walk`].
const DIR_WALK_CHANNEL_SIZE: usize = 100;

/// A supply of document paths.
pub trait Provider: Send + Sync {
    /// The shared queue of pending paths.
    fn source(&self) -> Source;

    /// Number of documents, or `None` when it is unknown and discovered
    /// as the source is drained.
    fn count(&self) -> Option<usize>;
}

/// Multi-consumer handle on a provider's queue.
#[derive(Clone, Debug)]
pub struct Source {
    rx: Arc<Mutex<mpsc::Receiver<PathBuf>>>,
}

impl Source {
    pub fn new(rx: mpsc::Receiver<PathBuf>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next pending path, or `None` once the producer is gone and the queue is empty.
    pub async fn next(&self) -> Option<PathBuf> {
        self.rx.lock().await.recv().await
    }
}

/// Provider over a channel whose length is not known up front.
#[derive(Debug, Clone)]
pub struct ChannelProvider {
    source: Source,
}

impl Provider for ChannelProvider {
    fn source(&self) -> Source {
        self.source.clone()
    }

    fn count(&self) -> Option<usize> {
        None
    }
}

/// Provider over a fixed list of files.
#[derive(Debug, Clone)]
pub struct SliceProvider {
    source: Source,
    len: usize,
}

impl Provider for SliceProvider {
    fn source(&self) -> Source {
        self.source.clone()
    }

    fn count(&self) -> Option<usize> {
        Some(self.len)
    }
}

/// Wrap an existing receiver. The batch ends when every sender is dropped.
pub fn from_channel(rx: mpsc::Receiver<PathBuf>) -> ChannelProvider {
    ChannelProvider {
        source: Source::new(rx),
    }
}

/// Provider over a fixed list of files, queued in order.
pub fn from_slice<I, P>(files: I) -> SliceProvider
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let files: Vec<PathBuf> = files.into_iter().map(Into::into).collect();
    let len = files.len();
    let (tx, rx) = mpsc::channel(len.max(1));
    for file in files {
        // Capacity equals the number of files, so this never fails.
        let _ = tx.try_send(file);
    }
    SliceProvider {
        source: Source::new(rx),
        len,
    }
}

/// Every `*.pdf` file directly inside `dir` (not recursive), sorted by name.
pub fn from_dir(dir: impl AsRef<Path>) -> Result<SliceProvider, Pdf2ImgError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Err(Pdf2ImgError::FileNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && is_pdf(&entry.path()) {
            files.push(entry.path());
        }
    }
    files.sort();
    debug!("Found {} PDF files in {}", files.len(), dir.display());

    Ok(from_slice(files))
}

/// Every `*.pdf` file below `dir`, discovered by a background walk.
///
/// The count is unknown: paths become available while the walk proceeds.
/// Unreadable directories are logged and skipped. Must be called from
/// within a Tokio runtime.
pub fn from_dir_walk(dir: impl Into<PathBuf>) -> ChannelProvider {
    let root = dir.into();
    let (tx, rx) = mpsc::channel(DIR_WALK_CHANNEL_SIZE);

    tokio::spawn(async move {
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("dir walk failed at {}: {}", dir.display(), e);
                    continue;
                }
            };

            let mut children = Vec::new();
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => children.push(entry.path()),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("dir walk failed at {}: {}", dir.display(), e);
                        break;
                    }
                }
            }
            children.sort();

            for path in children {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_dir() => pending.push(path),
                    Ok(meta) if meta.is_file() && is_pdf(&path) => {
                        if tx.send(path).await.is_err() {
                            // every consumer is gone
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("dir walk failed at {}: {}", path.display(), e),
                }
            }
        }
    });

    from_channel(rx)
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}
