//! Renderer backends.
//!
//! The engine never talks to poppler directly. Everything it needs from the
//! outside world goes through [`Backend`]: a page count per document, and a
//! running render process whose stderr yields progress lines. [`Poppler`] is
//! the production implementation; tests plug in a scripted one.

pub mod poppler;

pub use poppler::Poppler;

use crate::config::ConversionConfig;
use crate::error::Pdf2ImgError;
use crate::partition::PageRange;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;

/// External collaborators of the conversion engine.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Total number of pages in `pdf`.
    async fn page_count(&self, pdf: &Path) -> Result<u32, Pdf2ImgError>;

    /// Start rendering `job`. Returns once the process is running.
    async fn spawn(&self, job: &RenderJob) -> io::Result<RenderProcess>;
}

/// One renderer invocation: a page range of one document, for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJob {
    pub pdf: PathBuf,
    pub worker: usize,
    pub range: PageRange,
    /// Output base; the renderer appends `-<page>.<ext>`.
    pub output: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RenderJob {
    /// Build the command line
    /// `<binary> -progress -f <first> -l <last> <render args> <pdf> <output>`.
    pub fn new(config: &ConversionConfig, pdf: &Path, worker: usize, range: PageRange) -> Self {
        let output = config.output_base(pdf, worker, range.first, range.last);

        let mut args = vec![
            "-progress".to_string(),
            "-f".to_string(),
            range.first.to_string(),
            "-l".to_string(),
            range.last.to_string(),
        ];
        args.extend(config.render_args());
        args.push(pdf.to_string_lossy().into_owned());
        args.push(output.to_string_lossy().into_owned());

        Self {
            pdf: pdf.to_path_buf(),
            worker,
            range,
            output,
            program: config.command_path(config.binary().name()),
            args,
        }
    }
}

impl fmt::Display for RenderJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How a render process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub success: bool,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success() -> Self {
        Self {
            success: true,
            code: Some(0),
        }
    }

    pub fn failure(code: i32) -> Self {
        Self {
            success: false,
            code: Some(code),
        }
    }
}

enum Exit {
    Child(Child),
    Scripted(ProcessExit),
}

/// A running renderer: its stderr as a stream of lines, and its exit.
pub struct RenderProcess {
    lines: BoxStream<'static, io::Result<String>>,
    exit: Exit,
}

impl fmt::Debug for RenderProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exit = match &self.exit {
            Exit::Child(child) => format!("pid {:?}", child.id()),
            Exit::Scripted(exit) => format!("{exit:?}"),
        };
        f.debug_struct("RenderProcess").field("exit", &exit).finish()
    }
}

impl RenderProcess {
    /// Wrap a child spawned with a piped stderr.
    pub fn from_child(mut child: Child) -> io::Result<Self> {
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stderr is not captured"))?;
        Ok(Self {
            lines: lossy_lines(BufReader::new(stderr)),
            exit: Exit::Child(child),
        })
    }

    /// A process whose stderr is `reader` and which exits successfully.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            lines: lossy_lines(BufReader::new(reader)),
            exit: Exit::Scripted(ProcessExit::success()),
        }
    }

    /// A process whose output is an arbitrary stream and which exits successfully.
    pub fn from_lines<S>(lines: S) -> Self
    where
        S: futures::Stream<Item = io::Result<String>> + Send + 'static,
    {
        Self {
            lines: lines.boxed(),
            exit: Exit::Scripted(ProcessExit::success()),
        }
    }

    /// A process that prints `lines` and exits successfully.
    pub fn from_static<I>(lines: I) -> Self
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        Self::from_lines(stream::iter(lines.into_iter().map(Ok)))
    }

    /// Override the exit of a scripted process.
    pub fn with_exit(mut self, exit: ProcessExit) -> Self {
        if let Exit::Scripted(_) = self.exit {
            self.exit = Exit::Scripted(exit);
        }
        self
    }

    /// Next stderr line, `None` once the stream is closed.
    pub async fn next_line(&mut self) -> Option<io::Result<String>> {
        self.lines.next().await
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> io::Result<ProcessExit> {
        match &mut self.exit {
            Exit::Child(child) => {
                let status = child.wait().await?;
                Ok(ProcessExit {
                    success: status.success(),
                    code: status.code(),
                })
            }
            Exit::Scripted(exit) => Ok(*exit),
        }
    }

    /// Kill the process if it is still running.
    pub async fn kill(&mut self) {
        if let Exit::Child(child) = &mut self.exit {
            // already exited is fine
            let _ = child.kill().await;
        }
    }
}

/// Split `reader` into lines, replacing invalid UTF-8 instead of failing.
///
/// Poppler echoes raw bytes from the document (font and object names) in
/// its diagnostics, so only a failed read is an error here.
fn lossy_lines<R>(reader: R) -> BoxStream<'static, io::Result<String>>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    stream::try_unfold((reader, Vec::new()), |(mut reader, mut buf)| async move {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        let line = decode_line(&buf);
        Ok::<_, io::Error>(Some((line, (reader, buf))))
    })
    .boxed()
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageFormat;

    #[test]
    fn render_job_command_line() {
        let config = ConversionConfig::builder()
            .format(ImageFormat::Png)
            .dpi(100)
            .output_folder("/out")
            .build()
            .unwrap();
        let range = PageRange::new(82, 161).unwrap();
        let job = RenderJob::new(&config, Path::new("/docs/book.pdf"), 1, range);

        assert_eq!(job.output, PathBuf::from("/out/book"));
        assert_eq!(
            &job.args[..5],
            &["-progress", "-f", "82", "-l", "161"].map(String::from)
        );
        assert_eq!(job.args[job.args.len() - 2], "/docs/book.pdf");
        assert_eq!(job.args[job.args.len() - 1], "/out/book");
        assert!(job.args.contains(&"-png".to_string()));

        let line = job.to_string();
        assert!(line.starts_with("pdftoppm"), "got: {line}");
    }

    #[test]
    fn render_job_resolves_binary_in_poppler_path() {
        let config = ConversionConfig::builder()
            .poppler_path("/opt/poppler/bin")
            .format(ImageFormat::Tiff)
            .build()
            .unwrap();
        let job = RenderJob::new(&config, Path::new("a.pdf"), 0, PageRange::new(1, 1).unwrap());
        assert!(job.program.starts_with("/opt/poppler/bin"));
        assert!(job
            .program
            .to_string_lossy()
            .contains("pdftocairo"));
    }

    #[tokio::test]
    async fn scripted_process_replays_lines() {
        let mut p = RenderProcess::from_static(vec!["1 2 a-1.ppm".to_string(), "2 2 a-2.ppm".to_string()])
            .with_exit(ProcessExit::failure(3));
        assert_eq!(p.next_line().await.unwrap().unwrap(), "1 2 a-1.ppm");
        assert_eq!(p.next_line().await.unwrap().unwrap(), "2 2 a-2.ppm");
        assert!(p.next_line().await.is_none());
        assert_eq!(p.wait().await.unwrap(), ProcessExit::failure(3));
    }

    #[tokio::test]
    async fn invalid_utf8_on_stderr_is_decoded_lossily() {
        let stderr: &'static [u8] =
            b"1 3 /out/a-1.ppm\nSyntax Warning: font 'Caf\xe9' unknown\r\n2 3 /out/a-2.ppm\n3 3 /out/a-3.ppm";
        let mut p = RenderProcess::from_reader(stderr);

        assert_eq!(p.next_line().await.unwrap().unwrap(), "1 3 /out/a-1.ppm");
        assert_eq!(
            p.next_line().await.unwrap().unwrap(),
            "Syntax Warning: font 'Caf\u{FFFD}' unknown"
        );
        assert_eq!(p.next_line().await.unwrap().unwrap(), "2 3 /out/a-2.ppm");
        // last line without a trailing newline
        assert_eq!(p.next_line().await.unwrap().unwrap(), "3 3 /out/a-3.ppm");
        assert!(p.next_line().await.is_none());
    }
}
