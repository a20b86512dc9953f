//! # pdf2img
//!
//! Convert PDF documents into page images with the poppler tool-chain,
//! spreading the work over a bounded pool of concurrent renderer processes.
//!
//! ## How it works
//!
//! ```text
//! ConversionConfig
//!  │
//!  ├─ single document   pdfinfo → page range → split across N workers
//!  ├─ batch             N workers pull whole documents from a Provider
//!  │
//!  ├─ each worker runs  pdftoppm/pdftocairo -progress … and parses stderr
//!  └─ the Task          one entry channel, one ordered error list, one done signal
//! ```
//!
//! Images are written by the renderer itself; this crate never decodes them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2img::{convert, ConversionConfig, ImageFormat};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder()
//!         .format(ImageFormat::Png)
//!         .dpi(150)
//!         .output_folder("out")
//!         .build()?;
//!
//!     let mut task = convert("document.pdf", &config).await?;
//!     let entries = task.wait_and_collect().await;
//!     eprintln!("{} pages written", entries.len());
//!
//!     for err in task.errors().await {
//!         eprintln!("{err}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2img` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdf2img = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod convert;
pub mod convertor;
pub mod error;
pub mod partition;
pub mod progress;
pub mod provider;
pub mod task;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{Backend, Poppler, ProcessExit, RenderJob, RenderProcess};
pub use config::{Binary, ConversionConfig, ConversionConfigBuilder, ImageFormat, JpegOptions};
pub use convert::{
    convert, convert_files, convert_files_with_backend, convert_with_backend, page_count, pdf_info,
};
pub use convertor::{WorkerHandle, WorkerState};
pub use error::{ConversionError, FailureKind, Pdf2ImgError};
pub use partition::PageRange;
pub use progress::{Observable, Progress, ProgressEntry};
pub use provider::{Provider, Source};
pub use task::{Task, TaskKind};
pub use tokio_util::sync::CancellationToken;
