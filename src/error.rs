//! Error types for the pdf2img library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Pdf2ImgError`]: **Fatal**: the task cannot be built at all (bad page
//!   range, missing binary, unreadable document). Returned as
//!   `Err(Pdf2ImgError)` from the `convert*` entry points before any worker
//!   has been spawned, so no partial state is ever visible to the caller.
//!
//! * [`ConversionError`]: **Recorded**: one worker hit a problem while the
//!   task was running (spawn failure, syntax error on the renderer's stderr,
//!   timeout, cancellation). Workers never abort their siblings; the task
//!   collects every record and hands them out through
//!   [`crate::task::Task::errors`] once all workers are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf2img library.
#[derive(Debug, Error)]
pub enum Pdf2ImgError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// The resolved page range is empty.
    #[error("invalid page range from {first} to {last}")]
    InvalidPageRange { first: u32, last: u32 },

    /// The page-count resolver failed for a document.
    #[error("failed to get page count of '{path}': {detail}")]
    PageCountFailed { path: PathBuf, detail: String },

    // ── Binary errors ─────────────────────────────────────────────────────
    /// A poppler binary could not be found.
    #[error("poppler binary '{binary}' not found\nInstall poppler-utils or pass --poppler-path.")]
    BinaryNotFound { binary: String },

    /// `<binary> -v` ran but its output did not contain a version.
    #[error("failed to get version of {binary} binary: {detail}")]
    VersionProbeFailed { binary: String, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("wrong argument: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// What went wrong inside a worker.
///
/// Details are kept as strings so that records stay `Clone` and can be
/// serialised into a post-run report.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FailureKind {
    /// The renderer could not be started (binary missing, pipe setup failure).
    #[error("failed to spawn renderer: {detail}")]
    Spawn { detail: String },

    /// The renderer reported a syntax error in the document.
    #[error("got error from poppler: {line}")]
    Syntax { line: String },

    /// The renderer announced it is terminating abnormally.
    #[error("renderer is exiting: {line}")]
    Exiting { line: String },

    /// No progress line arrived within the per-page timeout.
    #[error("processing page {page} timeout after {after_ms}ms")]
    PageTimeout { page: u32, after_ms: u64 },

    /// The task's cancellation token fired.
    #[error("conversion cancelled")]
    Cancelled,

    /// The task's global timeout elapsed.
    #[error("conversion deadline exceeded")]
    DeadlineExceeded,

    /// The page-count resolver failed (batch mode).
    #[error("failed to get page count: {detail}")]
    PageCount { detail: String },

    /// The requested range does not fit the document (batch mode).
    #[error("invalid page range from {first} to {last}")]
    InvalidRange { first: u32, last: u32 },

    /// The renderer exited unsuccessfully without printing a reason.
    #[error("renderer exited with status {code:?}")]
    ExitStatus { code: Option<i32> },

    /// Reading the renderer's stderr failed.
    #[error("I/O error: {detail}")]
    Io { detail: String },

    /// The worker itself panicked.
    #[error("worker crashed: {detail}")]
    Crashed { detail: String },
}

impl FailureKind {
    /// Whether this failure came from the task-wide cancellation context.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// A structured error recorded by one worker.
///
/// Immutable once recorded. `page` is `None` when the failure cannot be tied
/// to a page (spawn failures, cancellation before the first progress line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionError {
    pub pdf: PathBuf,
    pub page: Option<u32>,
    pub worker: usize,
    pub kind: FailureKind,
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{} '{}'", self.worker, self.pdf.display())?;
        if let Some(page) = self.page {
            write!(f, " page {page}")?;
        }
        write!(f, ": {}", self.kind)
    }
}

impl std::error::Error for ConversionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
