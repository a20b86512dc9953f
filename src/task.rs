//! Tasks: a fixed pool of convertors presented as one stream and one outcome.
//!
//! A [`Task`] comes in two kinds:
//!
//! * **single**: one (usually large) document, split by page ranges across
//!   the workers once at construction;
//! * **batch**: many documents, each worker converting whole documents pulled
//!   from a shared [`Provider`].
//!
//! Both expose the same surface. Progress entries arrive on one bounded
//! channel; once every worker is terminal a supervisor publishes the ordered
//! error list, releases the task's cancellation context and fires the `done`
//! signal. The entry channel closing and `done` firing are separate events:
//! "no more data" never implies "no error".

use crate::backend::Backend;
use crate::config::ConversionConfig;
use crate::convertor::{Cancel, Convertor, Mode, Shared, WorkerHandle};
use crate::error::{ConversionError, FailureKind, Pdf2ImgError};
use crate::partition::{effective_job, resolve_range, split, BATCH_DEFAULT_JOB};
use crate::progress::{Observable, Progress, ProgressEntry};
use crate::provider::Provider;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Entry channel capacity of batch tasks, whose page count is unknown up front.
pub const BATCH_CHANNEL_SIZE: usize = 200;

type Outcome = Option<Arc<Vec<ConversionError>>>;

/// Which way work is assigned to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Single,
    Batch,
}

/// A running conversion.
///
/// Dropping a task that has not completed cancels its workers.
#[derive(Debug)]
pub struct Task {
    kind: TaskKind,
    workers: Vec<WorkerHandle>,
    entries: Option<mpsc::Receiver<ProgressEntry>>,
    done: watch::Receiver<Outcome>,
    aggregate: Arc<Progress>,
    cancel: Cancel,
    expected: Option<usize>,
}

impl Task {
    /// Split `pdf` across workers and start them all.
    ///
    /// Fails before any process is spawned when the page count cannot be
    /// resolved or the page range is empty.
    pub(crate) async fn single(
        pdf: PathBuf,
        config: ConversionConfig,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, Pdf2ImgError> {
        let page_count = backend.page_count(&pdf).await?;
        let range = resolve_range(config.first_page, config.last_page, page_count)?;
        let job = effective_job(range, config.job);
        let parts = split(range, job);
        info!(
            "Converting '{}' pages {} with {} workers",
            pdf.display(),
            range,
            job
        );

        let (tx, rx) = mpsc::channel(range.len() as usize);
        let aggregate = Arc::new(Progress::default());
        aggregate.reset(range.first, range.last);
        let cancel = Cancel::new(&config.cancellation, config.timeout);

        let shared = Shared {
            mode: Mode::Single,
            config: Arc::new(config),
            backend,
            entries: tx,
            aggregate: Arc::clone(&aggregate),
            cancel: cancel.clone(),
        };

        let mut workers = Vec::with_capacity(job);
        let mut handles = Vec::with_capacity(job);
        for (id, part) in parts.into_iter().enumerate() {
            debug!("Worker#{:02}: pages {}", id, part);
            let (convertor, handle) = Convertor::new(id, shared.clone());
            workers.push(handle);
            handles.push(convertor.start(pdf.clone(), part).await);
        }
        // workers hold the only senders now
        drop(shared);

        let done = supervise(handles, cancel.clone());
        Ok(Self {
            kind: TaskKind::Single,
            workers,
            entries: Some(rx),
            done,
            aggregate,
            cancel,
            expected: None,
        })
    }

    /// Start `config.job` workers (default 4) pulling from `provider`.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn batch(
        provider: &dyn Provider,
        config: ConversionConfig,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let job = config.job.unwrap_or(BATCH_DEFAULT_JOB).max(1);
        let expected = provider.count();
        info!(
            "Converting {} documents with {} workers",
            expected.map_or_else(|| "an unknown number of".to_string(), |n| n.to_string()),
            job
        );

        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_SIZE);
        let aggregate = Arc::new(Progress::default());
        let cancel = Cancel::new(&config.cancellation, config.timeout);

        let shared = Shared {
            mode: Mode::Batch,
            config: Arc::new(config),
            backend,
            entries: tx,
            aggregate: Arc::clone(&aggregate),
            cancel: cancel.clone(),
        };

        let mut workers = Vec::with_capacity(job);
        let mut handles = Vec::with_capacity(job);
        for id in 0..job {
            let (convertor, handle) = Convertor::new(id, shared.clone());
            workers.push(handle);
            handles.push(convertor.run_as_worker(provider.source()));
        }
        drop(shared);

        let done = supervise(handles, cancel.clone());
        Self {
            kind: TaskKind::Batch,
            workers,
            entries: Some(rx),
            done,
            aggregate,
            cancel,
            expected,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Per-worker progress and state, in worker order.
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Number of documents the provider announced, for batch tasks that know it.
    pub fn expected_documents(&self) -> Option<usize> {
        self.expected
    }

    /// Take the progress entries as a stream.
    ///
    /// Returns `None` when they were already taken. The caller then owns
    /// draining: the channel is bounded, and workers wait on a full channel.
    pub fn entries(&mut self) -> Option<ReceiverStream<ProgressEntry>> {
        self.entries.take().map(ReceiverStream::new)
    }

    /// Next progress entry, or `None` once every worker is done (or the
    /// entries were taken with [`Task::entries`]).
    pub async fn next_entry(&mut self) -> Option<ProgressEntry> {
        self.entries.as_mut()?.recv().await
    }

    /// Drain and discard the entries, then wait for the terminal signal.
    pub async fn wait(&mut self) {
        while self.next_entry().await.is_some() {}
        self.outcome().await;
    }

    /// Like [`Task::wait`] but returns every entry received.
    pub async fn wait_and_collect(&mut self) -> Vec<ProgressEntry> {
        let mut collected = Vec::new();
        while let Some(entry) = self.next_entry().await {
            collected.push(entry);
        }
        self.outcome().await;
        collected
    }

    /// Every recorded error, in worker order then recording order.
    /// Waits for the task to complete.
    pub async fn errors(&mut self) -> Vec<ConversionError> {
        self.wait().await;
        self.outcome().await.as_ref().clone()
    }

    /// First recorded error, if any. Waits for the task to complete.
    pub async fn error(&mut self) -> Option<ConversionError> {
        self.errors().await.into_iter().next()
    }

    /// Cancel every worker. Each still-running worker records a cancellation error.
    pub fn cancel(&self) {
        self.cancel.release();
    }

    async fn outcome(&self) -> Arc<Vec<ConversionError>> {
        let mut done = self.done.clone();
        // the supervisor never drops its sender before publishing
        let _ = done.wait_for(Option::is_some).await;
        let outcome = done.borrow().clone();
        outcome.unwrap_or_default()
    }
}

impl Observable for Task {
    fn total(&self) -> u32 {
        self.aggregate.total()
    }

    fn finished(&self) -> u32 {
        self.aggregate.finished()
    }

    fn current(&self) -> u32 {
        self.aggregate.current()
    }

    fn completed(&self) -> bool {
        self.done.borrow().is_some()
    }

    fn aborted(&self) -> bool {
        self.done
            .borrow()
            .as_ref()
            .is_some_and(|errors| !errors.is_empty())
    }

    fn unit(&self) -> &'static str {
        match self.kind {
            TaskKind::Single => "pages",
            TaskKind::Batch => "documents",
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !self.completed() {
            self.cancel.release();
        }
    }
}

/// Join the workers in order, then release the context and publish the outcome.
fn supervise(
    handles: Vec<JoinHandle<Vec<ConversionError>>>,
    cancel: Cancel,
) -> watch::Receiver<Outcome> {
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut errors = Vec::new();
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(recorded) => errors.extend(recorded),
                Err(e) => errors.push(ConversionError {
                    pdf: PathBuf::new(),
                    page: None,
                    worker: id,
                    kind: FailureKind::Crashed {
                        detail: e.to_string(),
                    },
                }),
            }
        }

        cancel.release();
        info!("Conversion finished with {} errors", errors.len());
        tx.send_replace(Some(Arc::new(errors)));
    });

    rx
}
