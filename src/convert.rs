//! Public conversion entry points.
//!
//! [`convert`] and [`convert_files`] run against the poppler binaries: they
//! probe the renderer version first and adjust options older releases do not
//! understand. The `*_with_backend` variants take any [`Backend`] and skip the
//! probe, which is what tests and alternative renderers use.

use crate::backend::{Backend, Poppler};
use crate::config::ConversionConfig;
use crate::error::Pdf2ImgError;
use crate::provider::Provider;
use crate::task::Task;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Convert one PDF, splitting its pages across workers.
///
/// Returns as soon as every worker's renderer is running.
///
/// # Errors
/// Returns `Err(Pdf2ImgError)` only when the task cannot be built:
/// - File not found
/// - Renderer binary missing or its version unreadable
/// - Page count unavailable
/// - Page range empty after resolving it against the page count
///
/// Failures while rendering are recorded on the task instead
/// (see [`Task::errors`]).
pub async fn convert(
    pdf: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<Task, Pdf2ImgError> {
    let pdf = pdf.as_ref();
    if !pdf.exists() {
        return Err(Pdf2ImgError::FileNotFound {
            path: pdf.to_path_buf(),
        });
    }

    let config = negotiate(config).await?;
    let backend = Arc::new(Poppler::new(&config));
    convert_with_backend(pdf, &config, backend).await
}

/// Convert every document of `provider`, one document per worker at a time.
///
/// # Errors
/// Renderer binary missing or its version unreadable. Per-document failures
/// (page count, range, rendering) are recorded on the task.
pub async fn convert_files(
    provider: &dyn Provider,
    config: &ConversionConfig,
) -> Result<Task, Pdf2ImgError> {
    let config = negotiate(config).await?;
    let backend = Arc::new(Poppler::new(&config));
    Ok(convert_files_with_backend(provider, &config, backend).await)
}

/// [`convert`] with an explicit backend and no version probe.
pub async fn convert_with_backend(
    pdf: impl AsRef<Path>,
    config: &ConversionConfig,
    backend: Arc<dyn Backend>,
) -> Result<Task, Pdf2ImgError> {
    let pdf = pdf.as_ref().to_path_buf();
    info!("Starting conversion: {}", pdf.display());
    Task::single(pdf, config.clone(), backend).await
}

/// [`convert_files`] with an explicit backend and no version probe.
pub async fn convert_files_with_backend(
    provider: &dyn Provider,
    config: &ConversionConfig,
    backend: Arc<dyn Backend>,
) -> Task {
    Task::batch(provider, config.clone(), backend)
}

/// Number of pages of `pdf`, from `pdfinfo`.
///
/// Uses the config's poppler path and passwords.
pub async fn page_count(
    pdf: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<u32, Pdf2ImgError> {
    Poppler::new(config).pages(pdf.as_ref()).await
}

/// Document metadata as printed by `pdfinfo`.
pub async fn pdf_info(
    pdf: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<HashMap<String, String>, Pdf2ImgError> {
    Poppler::new(config).pdf_info(pdf.as_ref()).await
}

async fn negotiate(config: &ConversionConfig) -> Result<ConversionConfig, Pdf2ImgError> {
    let binary = config.binary();
    let (major, minor) = Poppler::new(config).version(binary).await?;
    debug!("{} version {}.{}", binary.name(), major, minor);

    let mut config = config.clone();
    config.negotiate_version(major, minor);
    Ok(config)
}
