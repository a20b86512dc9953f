//! Configuration types for PDF-to-image conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. The config is frozen once a task is
//! constructed: workers only ever read it, through a shared `Arc`.

use crate::error::Pdf2ImgError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Output naming collaborator: `(pdf, worker_index, first_page, last_page) -> name`.
///
/// Called once per worker job assignment. Must be pure.
pub type NameFn = Arc<dyn Fn(&Path, usize, u32, u32) -> String + Send + Sync>;

/// Configuration for a PDF-to-image conversion.
///
/// # Example
/// ```rust
/// use pdf2img::{ConversionConfig, ImageFormat};
///
/// let config = ConversionConfig::builder()
///     .dpi(150)
///     .format(ImageFormat::Png)
///     .page_range(22, 42)
///     .job(3)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Directory holding the poppler binaries. `None` resolves them via `PATH`.
    pub poppler_path: Option<PathBuf>,

    /// Rendering resolution. Default: 200.
    pub dpi: u32,

    /// Requested output format. Default: [`ImageFormat::Ppm`].
    pub format: ImageFormat,

    /// First page to convert (1-based, inclusive). Default: 1.
    pub first_page: u32,

    /// Last page to convert (inclusive). `None` means "end of document".
    pub last_page: Option<u32>,

    /// Number of concurrent workers. `None` lets the task infer it.
    pub job: Option<usize>,

    /// Deadline for the whole task.
    pub timeout: Option<Duration>,

    /// Maximum silence between two progress lines of a single-document worker.
    pub per_page_timeout: Option<Duration>,

    /// Promote syntax errors reported by the renderer to worker-stopping failures.
    pub strict: bool,

    pub user_password: Option<String>,
    pub owner_password: Option<String>,

    pub grayscale: bool,
    /// Transparent page background; forces `pdftocairo` for PNG and TIFF.
    pub transparent: bool,
    pub use_cropbox: bool,
    pub hide_annotations: bool,
    /// Render only the first page of each range into a file without page suffix.
    pub single_file: bool,
    /// Use `pdftocairo` even when `pdftoppm` could handle the format.
    pub use_pdftocairo: bool,

    /// Fit pages into a `scale_to`×`scale_to` box. Takes precedence over the per-axis values.
    pub scale_to: Option<u32>,
    pub scale_to_x: Option<u32>,
    pub scale_to_y: Option<u32>,

    /// JPEG encoder options (ignored for other formats).
    pub jpeg: JpegOptions,

    /// Output file base name. Default: the PDF's file stem.
    pub output_file: Option<String>,
    /// Output directory. Default: the PDF's parent directory.
    pub output_folder: Option<PathBuf>,
    pub output_file_fn: Option<NameFn>,
    pub output_folder_fn: Option<NameFn>,

    /// Cancellation context shared by every worker of the task.
    pub cancellation: CancellationToken,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            poppler_path: None,
            dpi: 200,
            format: ImageFormat::default(),
            first_page: 1,
            last_page: None,
            job: None,
            timeout: None,
            per_page_timeout: None,
            strict: false,
            user_password: None,
            owner_password: None,
            grayscale: false,
            transparent: false,
            use_cropbox: false,
            hide_annotations: false,
            single_file: false,
            use_pdftocairo: false,
            scale_to: None,
            scale_to_x: None,
            scale_to_y: None,
            jpeg: JpegOptions::default(),
            output_file: None,
            output_folder: None,
            output_file_fn: None,
            output_folder_fn: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("poppler_path", &self.poppler_path)
            .field("dpi", &self.dpi)
            .field("format", &self.format)
            .field("first_page", &self.first_page)
            .field("last_page", &self.last_page)
            .field("job", &self.job)
            .field("timeout", &self.timeout)
            .field("per_page_timeout", &self.per_page_timeout)
            .field("strict", &self.strict)
            .field("binary", &self.binary())
            .field("output_file", &self.output_file)
            .field("output_folder", &self.output_folder)
            .field("output_file_fn", &self.output_file_fn.as_ref().map(|_| "<fn>"))
            .field("output_folder_fn", &self.output_folder_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// The poppler binary that will render pages.
    ///
    /// `pdftocairo` is picked when asked for explicitly, for TIFF output, or
    /// for transparent PNG/TIFF output; `pdftoppm` otherwise.
    pub fn binary(&self) -> Binary {
        let format = self.format;
        if self.use_pdftocairo
            || format == ImageFormat::Tiff
            || (self.transparent && matches!(format, ImageFormat::Png | ImageFormat::Tiff))
        {
            Binary::Pdftocairo
        } else {
            Binary::Pdftoppm
        }
    }

    /// The format actually written. `pdftocairo` cannot emit PPM and falls back to PNG.
    pub fn effective_format(&self) -> ImageFormat {
        match (self.binary(), self.format) {
            (Binary::Pdftocairo, ImageFormat::Ppm) => ImageFormat::Png,
            (_, format) => format,
        }
    }

    /// Resolve a poppler binary name to the path that will be executed.
    pub fn command_path(&self, binary: &str) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{binary}.exe")
        } else {
            binary.to_string()
        };
        match &self.poppler_path {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Renderer arguments shared by every job of a task: everything except
    /// the page range, the input PDF and the output base.
    pub fn render_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let binary = self.binary();

        args.extend(["-r".to_string(), self.dpi.to_string()]);

        if let Some(flag) = self.effective_format().flag() {
            args.push(flag.to_string());
        }

        if self.effective_format() == ImageFormat::Jpeg {
            if let Some(opt) = self.jpeg.to_arg() {
                args.extend(["-jpegopt".to_string(), opt]);
            }
        }

        if let Some(ref pw) = self.user_password {
            args.extend(["-upw".to_string(), pw.clone()]);
        }
        if let Some(ref pw) = self.owner_password {
            args.extend(["-opw".to_string(), pw.clone()]);
        }

        if self.grayscale {
            args.push("-gray".to_string());
        }
        if self.transparent && binary == Binary::Pdftocairo {
            args.push("-transp".to_string());
        }
        if self.use_cropbox {
            args.push("-cropbox".to_string());
        }
        if self.hide_annotations {
            args.push("-hide-annotations".to_string());
        }
        if self.single_file {
            args.push("-singlefile".to_string());
        }

        // size related options
        if let Some(size) = self.scale_to {
            args.extend(["-scale-to".to_string(), size.to_string()]);
        } else {
            if let Some(x) = self.scale_to_x {
                args.extend(["-scale-to-x".to_string(), x.to_string()]);
            }
            if let Some(y) = self.scale_to_y {
                args.extend(["-scale-to-y".to_string(), y.to_string()]);
            }
        }

        args
    }

    /// Output base path for one job: folder joined with file base name.
    ///
    /// The renderer appends `-<page>.<ext>` to this base itself.
    pub fn output_base(&self, pdf: &Path, worker: usize, first: u32, last: u32) -> PathBuf {
        let file = match (&self.output_file_fn, &self.output_file) {
            (Some(f), _) => f(pdf, worker, first, last),
            (None, Some(name)) => name.clone(),
            (None, None) => pdf
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "page".to_string()),
        };

        let folder = match (&self.output_folder_fn, &self.output_folder) {
            (Some(f), _) => PathBuf::from(f(pdf, worker, first, last)),
            (None, Some(dir)) => dir.clone(),
            (None, None) => pdf.parent().map(Path::to_path_buf).unwrap_or_default(),
        };

        folder.join(file)
    }

    /// Adjust options that older poppler releases do not understand.
    pub(crate) fn negotiate_version(&mut self, major: u32, minor: u32) {
        if major == 0 {
            if minor <= 57 {
                self.jpeg = JpegOptions::default();
            }
            if minor <= 83 {
                self.hide_annotations = false;
            }
        }
    }
}

/// Builder for [`ConversionConfig`].
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl fmt::Debug for ConversionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConversionConfigBuilder")
            .field(&self.config)
            .finish()
    }
}

impl ConversionConfigBuilder {
    pub fn poppler_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.poppler_path = Some(dir.into());
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn format(mut self, format: ImageFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn first_page(mut self, page: u32) -> Self {
        self.config.first_page = page;
        self
    }

    pub fn last_page(mut self, page: u32) -> Self {
        self.config.last_page = Some(page);
        self
    }

    /// Convert pages `first..=last`.
    pub fn page_range(mut self, first: u32, last: u32) -> Self {
        self.config.first_page = first;
        self.config.last_page = Some(last);
        self
    }

    /// Number of concurrent workers, clamped to at least 1.
    pub fn job(mut self, n: usize) -> Self {
        self.config.job = Some(n.max(1));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn per_page_timeout(mut self, timeout: Duration) -> Self {
        self.config.per_page_timeout = Some(timeout);
        self
    }

    pub fn strict(mut self, v: bool) -> Self {
        self.config.strict = v;
        self
    }

    pub fn user_password(mut self, pw: impl Into<String>) -> Self {
        self.config.user_password = Some(pw.into());
        self
    }

    pub fn owner_password(mut self, pw: impl Into<String>) -> Self {
        self.config.owner_password = Some(pw.into());
        self
    }

    pub fn grayscale(mut self, v: bool) -> Self {
        self.config.grayscale = v;
        self
    }

    pub fn transparent(mut self, v: bool) -> Self {
        self.config.transparent = v;
        self
    }

    pub fn use_cropbox(mut self, v: bool) -> Self {
        self.config.use_cropbox = v;
        self
    }

    pub fn hide_annotations(mut self, v: bool) -> Self {
        self.config.hide_annotations = v;
        self
    }

    pub fn single_file(mut self, v: bool) -> Self {
        self.config.single_file = v;
        self
    }

    pub fn use_pdftocairo(mut self, v: bool) -> Self {
        self.config.use_pdftocairo = v;
        self
    }

    /// Fit each page into a `size`×`size` box, preserving aspect ratio.
    pub fn scale_to(mut self, size: u32) -> Self {
        self.config.scale_to = Some(size);
        self
    }

    pub fn scale_to_x(mut self, size: u32) -> Self {
        self.config.scale_to_x = Some(size);
        self
    }

    pub fn scale_to_y(mut self, size: u32) -> Self {
        self.config.scale_to_y = Some(size);
        self
    }

    /// JPEG quality 0–100; anything else falls back to 75.
    pub fn jpeg_quality(mut self, quality: u32) -> Self {
        let quality = if quality > 100 { 75 } else { quality as u8 };
        self.config.jpeg.quality = Some(quality);
        self
    }

    pub fn jpeg_optimize(mut self, v: bool) -> Self {
        self.config.jpeg.optimize = Some(v);
        self
    }

    pub fn jpeg_progressive(mut self, v: bool) -> Self {
        self.config.jpeg.progressive = Some(v);
        self
    }

    pub fn output_file(mut self, name: impl Into<String>) -> Self {
        self.config.output_file = Some(name.into());
        self
    }

    pub fn output_folder(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_folder = Some(dir.into());
        self
    }

    pub fn output_file_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Path, usize, u32, u32) -> String + Send + Sync + 'static,
    {
        self.config.output_file_fn = Some(Arc::new(f));
        self
    }

    pub fn output_folder_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Path, usize, u32, u32) -> String + Send + Sync + 'static,
    {
        self.config.output_folder_fn = Some(Arc::new(f));
        self
    }

    /// Share an existing cancellation token with the task.
    ///
    /// The task derives a child token from it, so completing the task never
    /// cancels the caller's token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancellation = token;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Pdf2ImgError> {
        let c = &self.config;
        if c.dpi == 0 || c.dpi > 2400 {
            return Err(Pdf2ImgError::InvalidConfig(format!(
                "DPI must be 1–2400, got {}",
                c.dpi
            )));
        }
        if c.first_page == 0 {
            return Err(Pdf2ImgError::InvalidConfig(
                "pages are 1-indexed, first page must be ≥ 1".into(),
            ));
        }
        if let Some(last) = c.last_page {
            if c.first_page > last {
                return Err(Pdf2ImgError::InvalidPageRange {
                    first: c.first_page,
                    last,
                });
            }
        }
        if c.binary() == Binary::Pdftocairo && c.hide_annotations {
            return Err(Pdf2ImgError::InvalidConfig(
                "hideAnnotations is not supported with pdftocairo".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Portable pixmap (PGM when grayscale). (default)
    #[default]
    Ppm,
    Png,
    Jpeg,
    Tiff,
}

impl ImageFormat {
    /// Renderer flag selecting this format. PPM is the renderer's default.
    pub fn flag(self) -> Option<&'static str> {
        match self {
            ImageFormat::Ppm => None,
            ImageFormat::Png => Some("-png"),
            ImageFormat::Jpeg => Some("-jpeg"),
            ImageFormat::Tiff => Some("-tiff"),
        }
    }

    /// File extension the renderer gives the images it writes.
    pub fn extension(self, grayscale: bool) -> &'static str {
        match self {
            ImageFormat::Ppm if grayscale => "pgm",
            ImageFormat::Ppm => "ppm",
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Tiff => "tif",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = Pdf2ImgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.strip_prefix('.').unwrap_or(&lower) {
            "ppm" | "pgm" => Ok(ImageFormat::Ppm),
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            "tif" | "tiff" => Ok(ImageFormat::Tiff),
            other => Err(Pdf2ImgError::InvalidConfig(format!(
                "unsupported image format '{other}'"
            ))),
        }
    }
}

/// The poppler renderer binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binary {
    Pdftoppm,
    Pdftocairo,
}

impl Binary {
    pub fn name(self) -> &'static str {
        match self {
            Binary::Pdftoppm => "pdftoppm",
            Binary::Pdftocairo => "pdftocairo",
        }
    }
}

/// JPEG encoder options passed through `-jpegopt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JpegOptions {
    pub quality: Option<u8>,
    pub optimize: Option<bool>,
    pub progressive: Option<bool>,
}

impl JpegOptions {
    /// Render as `quality=N,optimize=y,progressive=n`, or `None` when empty.
    pub fn to_arg(&self) -> Option<String> {
        let yn = |v: bool| if v { "y" } else { "n" };
        let mut parts = Vec::new();
        if let Some(q) = self.quality {
            parts.push(format!("quality={q}"));
        }
        if let Some(o) = self.optimize {
            parts.push(format!("optimize={}", yn(o)));
        }
        if let Some(p) = self.progressive {
            parts.push(format!("progressive={}", yn(p)));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(","))
        }
    }
}
