//! Convertor: one worker owning at most one renderer process at a time.
//!
//! ## Line protocol
//!
//! Run with `-progress`, poppler prints one line per written page on stderr:
//!
//! ```text
//! <page> <last page of the job> <output file>
//! ```
//!
//! Two other kinds of line matter:
//!
//! * anything containing `Syntax Error` is a content problem in the document.
//!   Strict mode stops the job; otherwise it is recorded and the worker keeps
//!   draining output.
//! * anything ending in `exiting` means the renderer is giving up. Always fatal
//!   for the job.
//!
//! Everything else is noise and ignored.
//!
//! ## State machine
//!
//! ```text
//! Idle ──► Spawning ──► Active ──► Idle      (batch: next document)
//!   │          │           │
//!   └──────────┴───────────┴────► Terminal  (exactly once)
//! ```
//!
//! A worker waits on several things at once in a single `select!`: the task's
//! cancellation token, the per-page timer (single-document mode) and the next
//! stderr line. Whatever fires first wins.

use crate::backend::{Backend, RenderJob, RenderProcess};
use crate::config::ConversionConfig;
use crate::error::{ConversionError, FailureKind};
use crate::partition::{resolve_range, PageRange};
use crate::progress::{Observable, Progress, ProgressEntry};
use crate::provider::Source;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const SYNTAX_MARKER: &str = "Syntax Error";
const EXITING_MARKER: &str = "exiting";

/// One stderr line of the renderer, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Progress {
        page: u32,
        total: u32,
        output: PathBuf,
    },
    Syntax(String),
    Exiting(String),
    Ignored,
}

impl Line {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end();
        if line.ends_with(EXITING_MARKER) {
            return Line::Exiting(line.to_string());
        }
        if line.contains(SYNTAX_MARKER) {
            return Line::Syntax(line.to_string());
        }

        // output paths may contain spaces, so only the first two fields are split off
        let mut fields = line.splitn(3, ' ');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(page), Some(total), Some(output)) if !output.is_empty() => {
                match (page.parse(), total.parse()) {
                    (Ok(page), Ok(total)) => Line::Progress {
                        page,
                        total,
                        output: PathBuf::from(output),
                    },
                    _ => Line::Ignored,
                }
            }
            _ => Line::Ignored,
        }
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Between jobs, no process.
    Idle,
    /// Resolving the page range and starting the renderer.
    Spawning,
    /// Reading the renderer's progress.
    Active,
    /// Finished for good; `aborted` when any error was recorded.
    Terminal { aborted: bool },
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminal { .. })
    }
}

/// Read-only view of one worker, safe to poll while the task runs.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: usize,
    progress: Arc<Progress>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Page counters of the worker's current job.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Wait until the worker is terminal and return its final state.
    pub async fn terminated(&self) -> WorkerState {
        let mut rx = self.state.clone();
        // the sender only goes away after the terminal state is published
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        let state = *rx.borrow();
        state
    }
}

impl Observable for WorkerHandle {
    fn total(&self) -> u32 {
        self.progress.total()
    }

    fn finished(&self) -> u32 {
        self.progress.finished()
    }

    fn current(&self) -> u32 {
        self.progress.current()
    }

    fn completed(&self) -> bool {
        self.state().is_terminal()
    }

    fn aborted(&self) -> bool {
        matches!(self.state(), WorkerState::Terminal { aborted: true })
    }
}

/// Task-wide cancellation: a child of the caller's token plus an optional
/// deadline. Remembers whether the deadline is what fired.
#[derive(Debug, Clone)]
pub(crate) struct Cancel {
    token: CancellationToken,
    expired: Arc<AtomicBool>,
}

impl Cancel {
    /// Must be called from within a Tokio runtime when `timeout` is set.
    pub(crate) fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let expired = Arc::new(AtomicBool::new(false));

        if let Some(timeout) = timeout {
            let token = token.clone();
            let expired = Arc::clone(&expired);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        debug!("Task deadline of {:?} exceeded", timeout);
                        expired.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            });
        }

        Self { token, expired }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Failure recorded by a worker interrupted by this context.
    pub(crate) fn kind(&self) -> FailureKind {
        if self.expired.load(Ordering::SeqCst) {
            FailureKind::DeadlineExceeded
        } else {
            FailureKind::Cancelled
        }
    }

    /// Release the deadline timer. Never cancels the caller's token.
    pub(crate) fn release(&self) {
        self.token.cancel();
    }
}

/// How the work is assigned to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// A fixed page range of one document.
    Single,
    /// Whole documents pulled from a shared source.
    Batch,
}

/// Everything the workers of one task share. Cloned into each worker.
#[derive(Clone)]
pub(crate) struct Shared {
    pub mode: Mode,
    pub config: Arc<ConversionConfig>,
    pub backend: Arc<dyn Backend>,
    pub entries: mpsc::Sender<ProgressEntry>,
    /// Task-wide roll-up counters.
    pub aggregate: Arc<Progress>,
    pub cancel: Cancel,
}

enum Step {
    Cancelled,
    TimedOut,
    Line(Option<std::io::Result<String>>),
}

enum JobEnd {
    /// The job ended (cleanly or not) and the worker may take another one.
    Next,
    /// The worker must become terminal.
    Stop,
}

pub(crate) struct Convertor {
    id: usize,
    shared: Shared,
    progress: Arc<Progress>,
    state: watch::Sender<WorkerState>,
    errors: Vec<ConversionError>,
}

impl Convertor {
    pub(crate) fn new(id: usize, shared: Shared) -> (Self, WorkerHandle) {
        let progress = Arc::new(Progress::default());
        let (state, rx) = watch::channel(WorkerState::Idle);
        let handle = WorkerHandle {
            id,
            progress: Arc::clone(&progress),
            state: rx,
        };
        let convertor = Self {
            id,
            shared,
            progress,
            state,
            errors: Vec::new(),
        };
        (convertor, handle)
    }

    /// Single-document mode: start the renderer for `range` and return once
    /// it runs. The returned handle resolves to the worker's errors once the
    /// worker is terminal.
    ///
    /// A spawn failure is recorded (without a page) and leaves the worker
    /// terminal; it never fails the caller.
    pub(crate) async fn start(
        mut self,
        pdf: PathBuf,
        range: PageRange,
    ) -> JoinHandle<Vec<ConversionError>> {
        let job = RenderJob::new(&self.shared.config, &pdf, self.id, range);
        self.progress.reset(range.first, range.last);
        self.set_state(WorkerState::Spawning);
        debug!("Worker#{:02}: {}", self.id, job);

        match self.shared.backend.spawn(&job).await {
            Ok(process) => {
                self.set_state(WorkerState::Active);
                tokio::spawn(async move {
                    let timeout = self.shared.config.per_page_timeout;
                    self.drive(&job, process, timeout).await;
                    self.finish()
                })
            }
            Err(e) => {
                self.record(&pdf, None, FailureKind::Spawn {
                    detail: e.to_string(),
                });
                let errors = self.finish();
                tokio::spawn(async move { errors })
            }
        }
    }

    /// Batch mode: pull documents from `source` until it is exhausted or the
    /// task is cancelled.
    pub(crate) fn run_as_worker(self, source: Source) -> JoinHandle<Vec<ConversionError>> {
        tokio::spawn(self.work(source))
    }

    /// Record `kind` and tell whether the worker may keep going: `false`
    /// exactly when strict mode is on.
    pub(crate) fn receive_error(&mut self, pdf: &Path, page: Option<u32>, kind: FailureKind) -> bool {
        self.record(pdf, page, kind);
        !self.shared.config.strict
    }

    async fn work(mut self, source: Source) -> Vec<ConversionError> {
        let token = self.shared.cancel.token().clone();

        loop {
            self.set_state(WorkerState::Idle);

            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = source.next() => Some(next),
            };
            let pdf = match next {
                None => {
                    let kind = self.shared.cancel.kind();
                    self.record(Path::new(""), None, kind);
                    break;
                }
                Some(None) => break,
                Some(Some(pdf)) => pdf,
            };

            self.shared.aggregate.push_total(1);
            let end = self.convert_document(&pdf).await;
            self.shared.aggregate.incr(1);

            if let JobEnd::Stop = end {
                break;
            }
        }

        self.finish()
    }

    async fn convert_document(&mut self, pdf: &Path) -> JobEnd {
        self.set_state(WorkerState::Spawning);
        let token = self.shared.cancel.token().clone();
        let backend = Arc::clone(&self.shared.backend);

        let count = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            count = backend.page_count(pdf) => Some(count),
        };
        let count = match count {
            None => {
                let kind = self.shared.cancel.kind();
                self.record(pdf, None, kind);
                return JobEnd::Stop;
            }
            Some(Err(e)) => {
                self.record(pdf, None, FailureKind::PageCount {
                    detail: e.to_string(),
                });
                return JobEnd::Next;
            }
            Some(Ok(count)) => count,
        };

        let config = Arc::clone(&self.shared.config);
        let range = match resolve_range(config.first_page, config.last_page, count) {
            Ok(range) => range,
            Err(_) => {
                let last = config.last_page.filter(|&l| l <= count).unwrap_or(count);
                self.record(pdf, None, FailureKind::InvalidRange {
                    first: config.first_page,
                    last,
                });
                return JobEnd::Next;
            }
        };

        let job = RenderJob::new(&config, pdf, self.id, range);
        self.progress.reset(range.first, range.last);
        debug!("Worker#{:02}: {}", self.id, job);

        let process = match backend.spawn(&job).await {
            Ok(process) => process,
            Err(e) => {
                self.record(pdf, None, FailureKind::Spawn {
                    detail: e.to_string(),
                });
                return JobEnd::Stop;
            }
        };

        self.set_state(WorkerState::Active);
        self.drive(&job, process, None).await
    }

    /// Read the renderer's output until it closes, fails, or is interrupted.
    async fn drive(
        &mut self,
        job: &RenderJob,
        mut process: RenderProcess,
        page_timeout: Option<Duration>,
    ) -> JobEnd {
        let token = self.shared.cancel.token().clone();
        let errors_before = self.errors.len();
        // page the renderer is working on
        let mut pending = job.range.first;
        let mut deadline = page_timeout.map(|d| Instant::now() + d);

        enum Outcome {
            Drained,
            Failed,
            Cancelled,
        }

        let outcome = loop {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => Step::Cancelled,
                _ = page_timer(deadline) => Step::TimedOut,
                line = process.next_line() => Step::Line(line),
            };

            match step {
                Step::Cancelled => {
                    let kind = self.shared.cancel.kind();
                    self.record(&job.pdf, Some(pending), kind);
                    break Outcome::Cancelled;
                }
                Step::TimedOut => {
                    let after_ms = page_timeout.map(|d| d.as_millis() as u64).unwrap_or_default();
                    self.record(&job.pdf, Some(pending), FailureKind::PageTimeout {
                        page: pending,
                        after_ms,
                    });
                    break Outcome::Failed;
                }
                Step::Line(None) => break Outcome::Drained,
                Step::Line(Some(Err(e))) => {
                    self.record(&job.pdf, Some(pending), FailureKind::Io {
                        detail: e.to_string(),
                    });
                    break Outcome::Failed;
                }
                Step::Line(Some(Ok(line))) => match Line::parse(&line) {
                    Line::Progress {
                        page,
                        total,
                        output,
                    } => {
                        self.progress.record_page(page);
                        match self.shared.mode {
                            Mode::Single => self.shared.aggregate.record_page(page),
                            Mode::Batch => self.shared.aggregate.set_current(page),
                        }
                        pending = (page + 1).min(job.range.last);
                        deadline = page_timeout.map(|d| Instant::now() + d);

                        let entry = ProgressEntry {
                            page,
                            total,
                            output,
                            worker: self.id,
                        };
                        let interrupted = tokio::select! {
                            biased;
                            _ = token.cancelled() => true,
                            // a dropped receiver only means nobody listens any more
                            _ = self.shared.entries.send(entry) => false,
                        };
                        if interrupted {
                            let kind = self.shared.cancel.kind();
                            self.record(&job.pdf, Some(pending), kind);
                            break Outcome::Cancelled;
                        }
                    }
                    Line::Syntax(line) => {
                        if !self.receive_error(&job.pdf, Some(pending), FailureKind::Syntax { line }) {
                            break Outcome::Failed;
                        }
                    }
                    Line::Exiting(line) => {
                        self.receive_error(&job.pdf, Some(pending), FailureKind::Exiting { line });
                        break Outcome::Failed;
                    }
                    Line::Ignored => trace!("Worker#{:02}: {}", self.id, line),
                },
            }
        };

        match outcome {
            Outcome::Drained => {
                let recorded = self.errors.len() > errors_before;
                match process.wait().await {
                    Ok(exit) if !exit.success && !recorded => {
                        self.record(&job.pdf, None, FailureKind::ExitStatus { code: exit.code });
                    }
                    Err(e) if !recorded => {
                        self.record(&job.pdf, None, FailureKind::Io {
                            detail: e.to_string(),
                        });
                    }
                    _ => {}
                }
                debug!(
                    "Worker#{:02}: {} pages of '{}' done",
                    self.id,
                    self.progress.finished(),
                    job.pdf.display()
                );
                JobEnd::Next
            }
            Outcome::Failed => {
                process.kill().await;
                JobEnd::Next
            }
            Outcome::Cancelled => {
                process.kill().await;
                JobEnd::Stop
            }
        }
    }

    fn record(&mut self, pdf: &Path, page: Option<u32>, kind: FailureKind) {
        let err = ConversionError {
            pdf: pdf.to_path_buf(),
            page,
            worker: self.id,
            kind,
        };
        warn!("{}", err);
        self.errors.push(err);
    }

    fn set_state(&self, next: WorkerState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Enter `Terminal` and hand the recorded errors over.
    fn finish(mut self) -> Vec<ConversionError> {
        self.set_state(WorkerState::Terminal {
            aborted: !self.errors.is_empty(),
        });
        std::mem::take(&mut self.errors)
    }
}

async fn page_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
