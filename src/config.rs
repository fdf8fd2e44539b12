//! Configuration types for PDF table extraction.
//!
//! All pipeline behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. One struct holds every knob so it can
//! be shared across documents behind an `Arc` and logged in one line.

use crate::error::TableError;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for the table-extraction pipeline.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdf2table::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .dpi(200)
///     .chunk_height(1200)
///     .chunk_overlap(120)
///     .concurrency(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.chunk_height, 1200);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Rendering DPI used when rasterising each PDF page. Range: 72–400. Default: 200.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 4000.
    ///
    /// Caps either dimension regardless of DPI so an oversized page cannot
    /// exhaust memory.
    pub max_rendered_pixels: u32,

    /// Height of one vertical chunk in rendered pixels. Default: 1000.
    ///
    /// Tall pages hold more rows than a VLM transcribes reliably in one pass;
    /// chunks keep each request small enough to be read accurately.
    pub chunk_height: u32,

    /// Pixels shared by two consecutive chunks. Must be `< chunk_height`. Default: 100.
    ///
    /// A row cut in half by one chunk boundary appears whole in the next
    /// chunk; the page assembler removes the resulting duplicates.
    pub chunk_overlap: u32,

    /// Process-wide ceiling on in-flight extraction calls. Default: 4.
    pub concurrency: usize,

    /// Maximum attempts per chunk (first call included). Default: 6.
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds; doubles per retry. Default: 2000.
    pub retry_backoff_ms: u64,

    /// Upper bound for any single retry delay in milliseconds. Default: 60000.
    pub max_backoff_ms: u64,

    /// Per-call timeout in seconds. An elapsed timeout is retried. Default: 120.
    pub api_timeout_secs: u64,

    /// Timeout for downloading a URL input, in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Downscale chunk images wider than this before upload. `None` keeps full width.
    pub max_chunk_width: Option<u32>,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "gemini", "anthropic").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per chunk. Default: 4096.
    pub max_tokens: usize,

    /// Custom system prompt. If None, uses the built-in table prompt.
    pub system_prompt: Option<String>,

    /// Root directory for persisted documents. Default: `./storage`.
    pub storage_dir: PathBuf,

    /// Persist one PNG per page (served by the page-image endpoint). Default: true.
    pub save_page_images: bool,

    /// Debug: persist every chunk image. Default: false.
    pub save_chunk_images: bool,

    /// Debug: persist every raw backend answer. Default: false.
    pub save_raw_output: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_rendered_pixels: 4000,
            chunk_height: 1000,
            chunk_overlap: 100,
            concurrency: 4,
            max_attempts: 6,
            retry_backoff_ms: 2000,
            max_backoff_ms: 60_000,
            api_timeout_secs: 120,
            download_timeout_secs: 120,
            max_chunk_width: None,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            system_prompt: None,
            storage_dir: PathBuf::from("storage"),
            save_page_images: true,
            save_chunk_images: false,
            save_raw_output: false,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("chunk_height", &self.chunk_height)
            .field("chunk_overlap", &self.chunk_overlap)
            .field("concurrency", &self.concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("storage_dir", &self.storage_dir)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check the invariants the chunker and dispatcher rely on.
    pub fn validate(&self) -> Result<(), TableError> {
        if self.dpi < 72 || self.dpi > 400 {
            return Err(TableError::Config(format!(
                "DPI must be 72–400, got {}",
                self.dpi
            )));
        }
        if self.chunk_overlap >= self.chunk_height {
            return Err(TableError::Config(format!(
                "chunk overlap ({}) must be smaller than chunk height ({})",
                self.chunk_overlap, self.chunk_height
            )));
        }
        if self.concurrency == 0 {
            return Err(TableError::Config("Concurrency must be ≥ 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(TableError::Config("Max attempts must be ≥ 1".into()));
        }
        Ok(())
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn chunk_height(mut self, px: u32) -> Self {
        self.config.chunk_height = px;
        self
    }

    pub fn chunk_overlap(mut self, px: u32) -> Self {
        self.config.chunk_overlap = px;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn max_chunk_width(mut self, px: u32) -> Self {
        self.config.max_chunk_width = Some(px.max(64));
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = dir.into();
        self
    }

    pub fn save_page_images(mut self, v: bool) -> Self {
        self.config.save_page_images = v;
        self
    }

    pub fn save_chunk_images(mut self, v: bool) -> Self {
        self.config.save_chunk_images = v;
        self
    }

    pub fn save_raw_output(mut self, v: bool) -> Self {
        self.config.save_raw_output = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, TableError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
