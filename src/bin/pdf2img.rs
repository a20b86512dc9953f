//! CLI binary for pdf2img.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig` and prints progress entries.

use anyhow::{Context, Result};
use clap::Parser;
use pdf2img::provider::{self, Provider};
use pdf2img::{
    convert, convert_files, pdf_info, ConversionConfig, ImageFormat, Observable, Pdf2ImgError,
    Task,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Every page of a document as PNG next to it
  pdf2img --format png report.pdf

  # Pages 22 to 42 with three workers into ./out
  pdf2img -f 22 -l 42 -j 3 -o out report.pdf

  # Every PDF of a directory tree, one JSON object per written page
  pdf2img --recursive --json -o out ./papers

REQUIREMENTS:
  The poppler utilities (pdfinfo, pdftoppm, pdftocairo) must be on PATH,
  or point --poppler-path at the directory that holds them.
"#;

/// Convert PDF files to images with poppler.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2img",
    version,
    about = "Convert PDF files to images with poppler",
    long_about = "Convert PDF documents to page images. A single document is split by page \
ranges across concurrent renderer processes; several documents (or a directory) are converted \
one document per worker.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF files, or a single directory of PDFs.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output directory. Defaults to each document's own directory.
    #[arg(short, long, env = "PDF2IMG_OUTPUT")]
    output: Option<PathBuf>,

    /// Number of concurrent workers. Inferred from the page count when omitted.
    #[arg(short, long, env = "PDF2IMG_JOB")]
    job: Option<usize>,

    /// Rendering DPI (1–2400).
    #[arg(short, long, env = "PDF2IMG_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(1..=2400))]
    dpi: u32,

    /// First page to convert.
    #[arg(short, long, default_value_t = 1)]
    first_page: u32,

    /// Last page to convert. Defaults to the end of the document.
    #[arg(short, long)]
    last_page: Option<u32>,

    /// Image format: ppm, png, jpeg, tiff.
    #[arg(long, env = "PDF2IMG_FORMAT", default_value = "ppm", value_parser = parse_format)]
    format: ImageFormat,

    /// Stop a worker's job on the first syntax error reported by poppler.
    #[arg(long, env = "PDF2IMG_STRICT")]
    strict: bool,

    /// Give up on the whole conversion after this many seconds.
    #[arg(long, env = "PDF2IMG_TIMEOUT")]
    timeout: Option<u64>,

    /// Give up on a worker when a single page takes longer than this many seconds.
    #[arg(long, env = "PDF2IMG_PER_PAGE_TIMEOUT")]
    per_page_timeout: Option<u64>,

    /// Render in grayscale.
    #[arg(long)]
    grayscale: bool,

    /// Transparent page background (PNG and TIFF, uses pdftocairo).
    #[arg(long)]
    transparent: bool,

    /// Render with pdftocairo instead of pdftoppm.
    #[arg(long)]
    use_pdftocairo: bool,

    /// Directory holding the poppler binaries.
    #[arg(long, env = "POPPLER_PATH")]
    poppler_path: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2IMG_USER_PASSWORD")]
    upw: Option<String>,

    /// PDF owner password for encrypted documents.
    #[arg(long, env = "PDF2IMG_OWNER_PASSWORD")]
    opw: Option<String>,

    /// Walk the input directory recursively.
    #[arg(short, long)]
    recursive: bool,

    /// Print pdfinfo metadata only, no conversion.
    #[arg(long)]
    inspect_only: bool,

    /// One JSON object per written page on stdout.
    #[arg(long, env = "PDF2IMG_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2IMG_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2IMG_QUIET")]
    quiet: bool,
}

fn parse_format(s: &str) -> Result<ImageFormat, String> {
    s.parse().map_err(|e: Pdf2ImgError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        for input in &cli.inputs {
            let info = pdf_info(input, &config)
                .await
                .with_context(|| format!("Failed to inspect {}", input.display()))?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string(&info).context("Failed to serialize metadata")?
                );
            } else {
                println!("File:  {}", input.display());
                let mut keys: Vec<_> = info.keys().collect();
                keys.sort();
                for key in keys {
                    println!("{:<15} {}", format!("{key}:"), info[key]);
                }
            }
        }
        return Ok(());
    }

    // ── Start conversion ─────────────────────────────────────────────────
    let mut task = start(&cli, &config).await?;

    let token = config.cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling workers");
            token.cancel();
        }
    });

    // ── Drain progress ───────────────────────────────────────────────────
    let started = Instant::now();
    let stdout = io::stdout();
    while let Some(entry) = task.next_entry().await {
        let mut out = stdout.lock();
        if cli.json {
            let line = serde_json::to_string(&entry).context("Failed to serialize entry")?;
            writeln!(out, "{line}").context("Failed to write to stdout")?;
        } else if !cli.quiet {
            writeln!(
                out,
                "{} {:>4}/{:<4} {}",
                dim(&format!("worker#{:02}", entry.worker)),
                entry.page,
                entry.total,
                entry.output.display()
            )
            .context("Failed to write to stdout")?;
        }
    }

    let errors = task.errors().await;
    if !cli.quiet {
        print_summary(&task, errors.len(), started.elapsed());
    }
    for err in &errors {
        eprintln!("{} {}", red("error:"), err);
    }

    if !errors.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

async fn start(cli: &Cli, config: &ConversionConfig) -> Result<Task> {
    if let [input] = cli.inputs.as_slice() {
        if !input.is_dir() {
            return convert(input, config)
                .await
                .with_context(|| format!("Failed to convert {}", input.display()));
        }

        let provider: Box<dyn Provider> = if cli.recursive {
            Box::new(provider::from_dir_walk(input))
        } else {
            Box::new(
                provider::from_dir(input)
                    .with_context(|| format!("Failed to list {}", input.display()))?,
            )
        };
        return convert_files(provider.as_ref(), config)
            .await
            .context("Failed to start batch conversion");
    }

    let provider = provider::from_slice(cli.inputs.clone());
    convert_files(&provider, config)
        .await
        .context("Failed to start batch conversion")
}

fn build_config(cli: &Cli) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .dpi(cli.dpi)
        .format(cli.format)
        .first_page(cli.first_page)
        .strict(cli.strict)
        .grayscale(cli.grayscale)
        .transparent(cli.transparent)
        .use_pdftocairo(cli.use_pdftocairo);

    if let Some(last) = cli.last_page {
        builder = builder.last_page(last);
    }
    if let Some(job) = cli.job {
        builder = builder.job(job);
    }
    if let Some(secs) = cli.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = cli.per_page_timeout {
        builder = builder.per_page_timeout(Duration::from_secs(secs));
    }
    if let Some(ref dir) = cli.output {
        builder = builder.output_folder(dir);
    }
    if let Some(ref dir) = cli.poppler_path {
        builder = builder.poppler_path(dir);
    }
    if let Some(ref pw) = cli.upw {
        builder = builder.user_password(pw);
    }
    if let Some(ref pw) = cli.opw {
        builder = builder.owner_password(pw);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(progress: &dyn Observable, errors: usize, elapsed: Duration) {
    let status = if errors == 0 {
        green("done")
    } else {
        red(&format!("{errors} errors"))
    };
    eprintln!(
        "{} {}/{} {} in {:.1}s",
        status,
        progress.finished(),
        progress.total(),
        progress.unit(),
        elapsed.as_secs_f64()
    );
}
