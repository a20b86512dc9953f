//! Scripted renderer used by the integration tests.
//!
//! Emits poppler-style `-progress` lines for the requested page range, with
//! optional faults: extra lines injected before a given page, a delay per line,
//! raw bytes that are not valid UTF-8, a stall (stream stays open without
//! output), spawn failures, unknown documents, and a non-zero exit.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use pdf2img::{Backend, Pdf2ImgError, ProcessExit, RenderJob, RenderProcess};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct ScriptedBackend {
    default_pages: u32,
    pages: HashMap<PathBuf, u32>,
    unreadable: HashSet<PathBuf>,
    inject: Vec<(u32, String)>,
    inject_raw: Vec<(u32, Vec<u8>)>,
    delay: Option<Duration>,
    stall_after: Option<u32>,
    fail_spawn: bool,
    exit: Option<ProcessExit>,
    spawned: Mutex<Vec<RenderJob>>,
}

impl ScriptedBackend {
    pub fn with_pages(pages: u32) -> Self {
        Self {
            default_pages: pages,
            ..Self::default()
        }
    }

    pub fn document(mut self, pdf: impl Into<PathBuf>, pages: u32) -> Self {
        self.pages.insert(pdf.into(), pages);
        self
    }

    /// `page_count` fails for `pdf`.
    pub fn unreadable(mut self, pdf: impl Into<PathBuf>) -> Self {
        self.unreadable.insert(pdf.into());
        self
    }

    /// Print `line` right before the progress line of `page`.
    pub fn inject(mut self, page: u32, line: impl Into<String>) -> Self {
        self.inject.push((page, line.into()));
        self
    }

    /// Write `bytes` as a line of its own right before the progress line of
    /// `page`. The whole script is then served as a byte stream.
    pub fn inject_bytes(mut self, page: u32, bytes: impl Into<Vec<u8>>) -> Self {
        self.inject_raw.push((page, bytes.into()));
        self
    }

    pub fn delay(mut self, per_line: Duration) -> Self {
        self.delay = Some(per_line);
        self
    }

    /// Keep the stream open, silently, once `page` has been reported.
    pub fn stall_after(mut self, page: u32) -> Self {
        self.stall_after = Some(page);
        self
    }

    pub fn fail_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    pub fn exit(mut self, exit: ProcessExit) -> Self {
        self.exit = Some(exit);
        self
    }

    /// Every job spawned so far, in spawn order.
    pub fn spawned(&self) -> Vec<RenderJob> {
        self.spawned.lock().unwrap().clone()
    }

    fn script(&self, job: &RenderJob) -> Vec<Vec<u8>> {
        let mut lines = vec![b"pdftoppm: rendering with scripted backend".to_vec()];
        for page in job.range.first..=job.range.last {
            lines.extend(
                self.inject
                    .iter()
                    .filter(|(p, _)| *p == page)
                    .map(|(_, line)| line.clone().into_bytes()),
            );
            lines.extend(
                self.inject_raw
                    .iter()
                    .filter(|(p, _)| *p == page)
                    .map(|(_, bytes)| bytes.clone()),
            );
            lines.push(
                format!(
                    "{} {} {}-{:03}.ppm",
                    page,
                    job.range.last,
                    job.output.display(),
                    page
                )
                .into_bytes(),
            );
            if self.stall_after == Some(page) {
                break;
            }
        }
        lines
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn page_count(&self, pdf: &Path) -> Result<u32, Pdf2ImgError> {
        if self.unreadable.contains(pdf) {
            return Err(Pdf2ImgError::PageCountFailed {
                path: pdf.to_path_buf(),
                detail: "Syntax Error: Couldn't find trailer dictionary".into(),
            });
        }
        Ok(self.pages.get(pdf).copied().unwrap_or(self.default_pages))
    }

    async fn spawn(&self, job: &RenderJob) -> io::Result<RenderProcess> {
        if self.fail_spawn {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "No such file or directory (os error 2)",
            ));
        }
        self.spawned.lock().unwrap().push(job.clone());

        let lines = self.script(job);
        if !self.inject_raw.is_empty() {
            let bytes = lines.join(&b'\n');
            let process = RenderProcess::from_reader(io::Cursor::new(bytes));
            return Ok(match self.exit {
                Some(exit) => process.with_exit(exit),
                None => process,
            });
        }

        let lines: Vec<String> = lines
            .into_iter()
            .map(|line| String::from_utf8(line).unwrap())
            .collect();
        let delay = self.delay;
        let body = stream::iter(lines).then(move |line| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, io::Error>(line)
        });

        let process = if self.stall_after.is_some() {
            RenderProcess::from_lines(body.chain(stream::pending()))
        } else {
            RenderProcess::from_lines(body)
        };
        Ok(match self.exit {
            Some(exit) => process.with_exit(exit),
            None => process,
        })
    }
}

/// Install a test subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
