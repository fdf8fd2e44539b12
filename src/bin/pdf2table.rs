//! CLI binary for edgequake-pdf2table.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig`, follows the document's status stream with a progress
//! bar, and writes the export.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2table::{
    status_stream, DocumentState, ExportFormat, ExportRequest, ExtractionConfig,
    ExtractionService, ProcessingStatus,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
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
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress bar driven by status snapshots ─────────────────────────────────

struct StatusBar {
    bar: ProgressBar,
    activated: bool,
}

impl StatusBar {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rendering pages…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Self {
            bar,
            activated: false,
        }
    }

    /// Switch to the full bar once the chunk total is known.
    fn activate(&mut self, total_chunks: usize, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} chunks  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_chunks as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "{total_pages} pages split into {total_chunks} chunks"
            ))
        ));
        self.activated = true;
    }

    fn update(&mut self, status: &ProcessingStatus) {
        if !self.activated && status.total_chunks > 0 {
            self.activate(status.total_chunks, status.total_pages);
        }
        self.bar.set_position(status.resolved_chunks as u64);
        let msg = match (&status.message, status.current_page) {
            (Some(m), _) => m.clone(),
            (None, Some(page)) => format!("page {page}"),
            (None, None) => String::new(),
        };
        self.bar.set_message(msg);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract the tables of a statement to CSV (stdout)
  pdf2table statement.pdf

  # Write to a file, with a confidence column
  pdf2table statement.pdf -o statement.csv --confidence

  # JSON output from a URL
  pdf2table https://example.com/report.pdf --format json -o report.json

  # Smaller bands with more overlap for dense tables
  pdf2table --chunk-height 600 --chunk-overlap 120 dense.pdf

  # Keep raw model output and chunk images for debugging
  pdf2table --save-raw --save-chunks --storage-dir ./runs invoice.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
"#;

/// Extract tables from PDF files and URLs using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2table",
    version,
    about = "Extract tables from PDF files and URLs using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write the export to this file instead of stdout.
    #[arg(short, long, env = "PDF2TABLE_OUTPUT")]
    output: Option<PathBuf>,

    /// Export format.
    #[arg(long, env = "PDF2TABLE_FORMAT", value_enum, default_value = "csv")]
    format: FormatArg,

    /// Append a trailing confidence column.
    #[arg(long, env = "PDF2TABLE_CONFIDENCE")]
    confidence: bool,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDF2TABLE_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Chunk height in rendered pixels.
    #[arg(long, env = "PDF2TABLE_CHUNK_HEIGHT", default_value_t = 1000)]
    chunk_height: u32,

    /// Overlap between consecutive chunks in pixels (< chunk height).
    #[arg(long, env = "PDF2TABLE_CHUNK_OVERLAP", default_value_t = 100)]
    chunk_overlap: u32,

    /// Downscale chunks wider than this before upload.
    #[arg(long, env = "PDF2TABLE_MAX_CHUNK_WIDTH")]
    max_chunk_width: Option<u32>,

    /// Maximum concurrent VLM API calls.
    #[arg(short, long, env = "PDF2TABLE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Attempts per chunk, including the first call.
    #[arg(long, env = "PDF2TABLE_MAX_ATTEMPTS", default_value_t = 6)]
    max_attempts: u32,

    /// Base backoff between attempts in milliseconds.
    #[arg(long, env = "PDF2TABLE_RETRY_BACKOFF_MS", default_value_t = 2000)]
    retry_backoff_ms: u64,

    /// Upper bound for a single backoff in milliseconds.
    #[arg(long, env = "PDF2TABLE_MAX_BACKOFF_MS", default_value_t = 60_000)]
    max_backoff_ms: u64,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "PDF2TABLE_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Timeout for downloading a URL input, in seconds.
    #[arg(long, env = "PDF2TABLE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2TABLE_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PDF2TABLE_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per chunk.
    #[arg(long, env = "PDF2TABLE_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF2TABLE_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Directory holding per-document artifacts.
    #[arg(long, env = "PDF2TABLE_STORAGE_DIR", default_value = "storage")]
    storage_dir: PathBuf,

    /// Persist chunk images under chunks/.
    #[arg(long, env = "PDF2TABLE_SAVE_CHUNKS")]
    save_chunks: bool,

    /// Persist raw model output under raw/.
    #[arg(long, env = "PDF2TABLE_SAVE_RAW")]
    save_raw: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2TABLE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2TABLE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2TABLE_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for ExportFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Csv => ExportFormat::Csv,
            FormatArg::Json => ExportFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the feedback; keep library logs at error
    // level while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli).await?;
    let service = ExtractionService::from_config(config).context("Failed to initialise")?;

    let created = service
        .create_from_input(&cli.input, cli.password.clone())
        .await
        .context("Could not open the document")?;
    if !cli.quiet {
        eprintln!(
            "{} {}  {}",
            cyan("◆"),
            bold(&created.filename),
            dim(&format!("{} pages, id {}", created.page_count, created.document_id))
        );
    }

    // ── Follow progress ──────────────────────────────────────────────────
    let mut statuses = status_stream(&service, &created.document_id)?;
    let mut bar = show_progress.then(StatusBar::new);
    let mut last = service.status(&created.document_id)?;
    while let Some(status) = statuses.next().await {
        if let Some(ref mut bar) = bar {
            bar.update(&status);
        } else if !cli.quiet && status.percent() != last.percent() {
            eprintln!(
                "{} {:>3}%  {}/{} chunks",
                dim("…"),
                status.percent(),
                status.resolved_chunks,
                status.total_chunks
            );
        }
        last = status;
    }
    if let Some(bar) = bar {
        bar.finish();
    }

    if last.state == DocumentState::Failed {
        anyhow::bail!(
            "{} {}",
            red("✘"),
            last.message.unwrap_or_else(|| "extraction failed".to_string())
        );
    }

    if !cli.quiet {
        let mark = if last.failed_chunks == 0 {
            green("✔")
        } else {
            cyan("⚠")
        };
        eprintln!(
            "{}  {}/{} chunks extracted{}",
            mark,
            last.resolved_chunks - last.failed_chunks,
            last.total_chunks,
            last.message
                .as_deref()
                .map(|m| format!("  {}", dim(m)))
                .unwrap_or_default()
        );
    }

    // ── Export ───────────────────────────────────────────────────────────
    let request = ExportRequest {
        format: cli.format.into(),
        include_confidence: cli.confidence,
    };
    let artifact = service
        .export(&created.document_id, request)
        .await
        .context("Export failed")?;

    if let Some(ref path) = cli.output {
        tokio::fs::write(path, &artifact.bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!("   →  {}", bold(&path.display().to_string()));
        }
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(&artifact.bytes)
            .context("Failed to write to stdout")?;
    }

    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .dpi(cli.dpi)
        .chunk_height(cli.chunk_height)
        .chunk_overlap(cli.chunk_overlap)
        .concurrency(cli.concurrency)
        .max_attempts(cli.max_attempts)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .max_backoff_ms(cli.max_backoff_ms)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .storage_dir(cli.storage_dir.clone())
        .save_chunk_images(cli.save_chunks)
        .save_raw_output(cli.save_raw);

    if let Some(width) = cli.max_chunk_width {
        builder = builder.max_chunk_width(width);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }

    builder.build().context("Invalid configuration")
}
