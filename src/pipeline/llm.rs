//! Extraction backend: the one external call the pipeline makes per chunk.
//!
//! [`ExtractionBackend`] is the seam the dispatcher drives. It returns the
//! backend's raw answer or an [`ExtractionError`] classified as transient or
//! permanent; retries, timeouts and concurrency limits live in
//! [`crate::pipeline::dispatch`], not here.
//!
//! [`VisionBackend`] is the production implementation: it sends the chunk PNG
//! to a vision LLM through `edgequake-llm` with the table prompt from
//! [`crate::prompts`].

use crate::config::ExtractionConfig;
use crate::error::{ExtractionError, TableError};
use crate::pipeline::chunk::ChunkImage;
use crate::pipeline::encode::encode_chunk;
use crate::prompts::{chunk_instruction, DEFAULT_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sends one chunk image to an extraction service.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Extract the raw table text of `chunk`; `chunk_count` is the number of
    /// chunks on the chunk's page.
    async fn extract(&self, chunk: &ChunkImage, chunk_count: usize)
        -> Result<String, ExtractionError>;
}

/// [`ExtractionBackend`] backed by an `edgequake-llm` vision provider.
pub struct VisionBackend {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
    max_chunk_width: Option<u32>,
}

impl VisionBackend {
    /// Wrap an already-configured provider.
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_chunk_width: config.max_chunk_width,
        }
    }

    /// Resolve the provider from the config, then from the environment.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, TableError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ExtractionBackend for VisionBackend {
    async fn extract(
        &self,
        chunk: &ChunkImage,
        chunk_count: usize,
    ) -> Result<String, ExtractionError> {
        let start = Instant::now();
        let span = chunk.span;

        let image = chunk.image.clone();
        let max_width = self.max_chunk_width;
        let image_data = tokio::task::spawn_blocking(move || encode_chunk(&image, max_width))
            .await
            .map_err(|e| ExtractionError::permanent(format!("encode task panicked: {e}")))?
            .map_err(|e| ExtractionError::permanent(format!("image encoding failed: {e}")))?;

        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user_with_images(
                &chunk_instruction(span.page_number, span.chunk_index, chunk_count),
                vec![image_data],
            ),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;

        debug!(
            "Page {} chunk {}: {} input tokens, {} output tokens, {:?}",
            span.page_number,
            span.chunk_index,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(response.content)
    }
}

static RE_TRANSIENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(429|500|502|503|504)\b|rate.?limit|quota|resource.?exhausted|overloaded|unavailable|timed?\s?out|connection|temporar",
    )
    .unwrap()
});

static RE_RETRY_IN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)retry(?:[ -]after:?| in)\s+([0-9]+(?:\.[0-9]+)?)\s*s?").unwrap()
});

/// Classify a provider error message as transient or permanent.
///
/// Providers report rate limits, quota exhaustion and gateway errors as
/// free-form text; matching on it keeps the classification provider-agnostic.
pub fn classify_provider_error(message: &str) -> ExtractionError {
    if RE_TRANSIENT.is_match(message) {
        ExtractionError::Transient {
            detail: message.to_string(),
            retry_after: parse_retry_after(message),
        }
    } else {
        ExtractionError::permanent(message)
    }
}

/// Extract a server-suggested delay such as "Please retry in 31.18s".
fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = RE_RETRY_IN.captures(message)?;
    let secs: f64 = caps[1].parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Resolve the LLM provider, from most-specific to least-specific:
/// pre-built provider, named provider + model, `EDGEQUAKE_LLM_PROVIDER` +
/// `EDGEQUAKE_MODEL`, an OpenAI key, then full auto-detection.
fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, TableError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        TableError::Config(format!(
            "No LLM provider could be auto-detected from environment.\n\
            Set OPENAI_API_KEY, GEMINI_API_KEY, or ANTHROPIC_API_KEY.\n\
            Error: {}",
            e
        ))
    })?;

    Ok(llm_provider)
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, TableError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        TableError::Config(format!("LLM provider '{provider_name}' is not configured: {e}"))
    })
}
