//! Progress model shared by workers and tasks.
//!
//! Counters are plain atomics: workers bump them, any number of observers
//! (a progress display, a metrics exporter, a test) may poll them while the
//! task runs. Nothing here blocks.
//!
//! # Example
//!
//! ```rust
//! use pdf2img::Progress;
//!
//! let p = Progress::default();
//! p.reset(22, 42);
//! p.record_page(22);
//! assert_eq!((p.finished(), p.total(), p.current()), (1, 21, 22));
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

/// A parsed page-completion record emitted on the task's output channel.
///
/// Transient: the task does not retain entries; consumers decide whether to
/// display, collect, or discard them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Page that has just been written.
    pub page: u32,
    /// Total pages of the job, as reported by the renderer.
    pub total: u32,
    /// Image file the renderer wrote for this page.
    pub output: PathBuf,
    /// Id of the worker that reported the page.
    pub worker: usize,
}

/// Uniform progress capability of tasks and workers.
///
/// Display code consumes only this trait and never inspects whether it is
/// looking at a single-document task, a batch task, or one worker.
pub trait Observable {
    /// Units of work known so far.
    fn total(&self) -> u32;

    /// Units of work done. `finished() <= total()` always holds.
    fn finished(&self) -> u32;

    /// Page most recently converted. For a batch task, the page most
    /// recently converted by any worker, whatever its document.
    fn current(&self) -> u32;

    /// True once the terminal state has been reached.
    fn completed(&self) -> bool;

    /// True when the terminal state was reached with recorded failures.
    fn aborted(&self) -> bool;

    /// Name of the unit `total()` and `finished()` count, for display.
    fn unit(&self) -> &'static str {
        "pages"
    }
}

/// Lock-free progress counters.
#[derive(Debug, Default)]
pub struct Progress {
    current: AtomicU32,
    total: AtomicU32,
    finished: AtomicU32,
}

impl Progress {
    /// Start a new job covering `first..=last`.
    pub fn reset(&self, first: u32, last: u32) {
        self.current.store(first, Ordering::SeqCst);
        self.total.store(last - first + 1, Ordering::SeqCst);
        self.finished.store(0, Ordering::SeqCst);
    }

    /// Record that `page` has been written.
    pub fn record_page(&self, page: u32) {
        self.current.store(page, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_current(&self, page: u32) {
        self.current.store(page, Ordering::SeqCst);
    }

    pub fn push_total(&self, delta: u32) {
        self.total.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn incr(&self, delta: u32) {
        self.finished.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_total(&self, total: u32) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::SeqCst)
    }
}
