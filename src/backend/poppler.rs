//! Poppler command-line tools: `pdfinfo`, `pdftoppm`, `pdftocairo`.

use super::{Backend, RenderJob, RenderProcess};
use crate::config::{Binary, ConversionConfig};
use crate::error::Pdf2ImgError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default deadline for `pdfinfo` and `-v` probes.
pub const INFO_TIMEOUT: Duration = Duration::from_secs(10);

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\.(\d+)\.(\d+)").unwrap_or_else(|e| panic!("invalid version regex: {e}"))
});

/// Backend driving the poppler binaries as subprocesses.
#[derive(Debug, Clone)]
pub struct Poppler {
    config: ConversionConfig,
    info_timeout: Duration,
}

impl Poppler {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            config: config.clone(),
            info_timeout: INFO_TIMEOUT,
        }
    }

    pub fn with_info_timeout(mut self, timeout: Duration) -> Self {
        self.info_timeout = timeout;
        self
    }

    /// `pdfinfo` output as a key/value map.
    pub async fn pdf_info(&self, pdf: &Path) -> Result<HashMap<String, String>, Pdf2ImgError> {
        if !pdf.exists() {
            return Err(Pdf2ImgError::FileNotFound {
                path: pdf.to_path_buf(),
            });
        }

        let mut cmd = self.command("pdfinfo");
        cmd.arg(pdf);
        if let Some(ref pw) = self.config.user_password {
            cmd.arg("-upw").arg(pw);
        }
        if let Some(ref pw) = self.config.owner_password {
            cmd.arg("-opw").arg(pw);
        }
        debug!("Call using {:?}", cmd.as_std());

        let output = match tokio::time::timeout(self.info_timeout, cmd.output()).await {
            Ok(output) => output.map_err(|e| spawn_error("pdfinfo", e))?,
            Err(_) => {
                return Err(Pdf2ImgError::PageCountFailed {
                    path: pdf.to_path_buf(),
                    detail: format!("pdfinfo timed out after {:?}", self.info_timeout),
                })
            }
        };

        if !output.status.success() {
            return Err(Pdf2ImgError::PageCountFailed {
                path: pdf.to_path_buf(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(parse_info(&text))
    }

    /// Number of pages reported by `pdfinfo`.
    pub async fn pages(&self, pdf: &Path) -> Result<u32, Pdf2ImgError> {
        let info = self.pdf_info(pdf).await?;
        let failed = |detail: String| Pdf2ImgError::PageCountFailed {
            path: pdf.to_path_buf(),
            detail,
        };
        let pages = info
            .get("Pages")
            .ok_or_else(|| failed("missing 'Pages' entry".to_string()))?;
        pages
            .parse::<u32>()
            .map_err(|e| failed(format!("bad 'Pages' entry '{pages}': {e}")))
    }

    /// `(major, minor)` version of a renderer binary, from `<binary> -v`.
    pub async fn version(&self, binary: Binary) -> Result<(u32, u32), Pdf2ImgError> {
        let mut cmd = self.command(binary.name());
        cmd.arg("-v");

        let output = tokio::time::timeout(self.info_timeout, cmd.output())
            .await
            .map_err(|_| Pdf2ImgError::VersionProbeFailed {
                binary: binary.name().to_string(),
                detail: format!("timed out after {:?}", self.info_timeout),
            })?
            .map_err(|e| spawn_error(binary.name(), e))?;

        // poppler prints its version on stderr
        let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stdout));

        parse_version(&text).ok_or_else(|| Pdf2ImgError::VersionProbeFailed {
            binary: binary.name().to_string(),
            detail: format!("no version in output '{}'", text.trim()),
        })
    }

    fn command(&self, binary: &str) -> Command {
        let mut cmd = Command::new(self.config.command_path(binary));
        self.prepare(&mut cmd);
        cmd
    }

    fn prepare(&self, cmd: &mut Command) {
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        if let Some(ref dir) = self.config.poppler_path {
            let mut paths = vec![dir.clone()];
            if let Some(existing) = std::env::var_os("LD_LIBRARY_PATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            if let Ok(joined) = std::env::join_paths(paths) {
                cmd.env("LD_LIBRARY_PATH", joined);
            }
        }
    }
}

#[async_trait]
impl Backend for Poppler {
    async fn page_count(&self, pdf: &Path) -> Result<u32, Pdf2ImgError> {
        self.pages(pdf).await
    }

    async fn spawn(&self, job: &RenderJob) -> io::Result<RenderProcess> {
        if let Some(folder) = job.output.parent() {
            if !folder.as_os_str().is_empty() {
                tokio::fs::create_dir_all(folder).await?;
            }
        }

        let mut cmd = Command::new(&job.program);
        cmd.args(&job.args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        self.prepare(&mut cmd);

        let child = cmd.spawn()?;
        RenderProcess::from_child(child)
    }
}

fn spawn_error(binary: &str, e: io::Error) -> Pdf2ImgError {
    if e.kind() == io::ErrorKind::NotFound {
        Pdf2ImgError::BinaryNotFound {
            binary: binary.to_string(),
        }
    } else {
        Pdf2ImgError::Io(e)
    }
}

/// Parse `Key: value` lines. `I/O Error:` diagnostics are skipped.
pub(crate) fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter(|line| !line.starts_with("I/O Error:"))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

pub(crate) fn parse_version(text: &str) -> Option<(u32, u32)> {
    let caps = VERSION_RE.captures(text)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    Some((major, minor))
}
