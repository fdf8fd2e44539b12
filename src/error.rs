//! Error types for the edgequake-pdf2table library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`TableError`] (**Document scope**): the document cannot be processed or
//!   the requested resource does not exist (bad input file, wrong password,
//!   invalid configuration, unknown document). Also carries the polling
//!   conditions [`TableError::NotReady`] and [`TableError::NotFound`].
//!
//! * [`ChunkError`] (**Chunk scope**): one chunk could not be extracted or
//!   parsed. Stored on the chunk outcome and summarised on the
//!   [`crate::table::PageTable`]; sibling chunks are unaffected.
//!
//! * [`ExtractionError`] (**Backend scope**): the classification an
//!   [`crate::pipeline::llm::ExtractionBackend`] reports for one call. The
//!   dispatcher retries `Transient` and gives up on `Permanent`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All document-scope errors returned by the edgequake-pdf2table library.
#[derive(Debug, Error)]
pub enum TableError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file is unreadable, not a PDF, or the password is wrong/missing.
    #[error("Invalid document: {detail}")]
    InvalidDocument { detail: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// Rendering a single page failed after the document was opened.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// Every chunk of every page failed; there is nothing to assemble.
    #[error("Table extraction failed: all {total} chunks failed.\nFirst error: {first_error}")]
    AllChunksFailed { total: usize, first_error: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or chunker validation failed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    // ── Polling conditions ────────────────────────────────────────────────
    /// The requested artifact exists conceptually but is not assembled yet.
    #[error("{what} is not ready yet; retry later")]
    NotReady { what: String },

    /// Unknown document id or page number.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The document was cancelled before all chunks resolved.
    #[error("Processing was cancelled")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Reading or writing a persisted artifact failed.
    #[error("Storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The export artifact could not be produced.
    #[error("Export failed: {0}")]
    Export(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TableError {
    /// Shorthand for a `NotReady` condition.
    pub fn not_ready(what: impl Into<String>) -> Self {
        TableError::NotReady { what: what.into() }
    }

    /// Shorthand for a `NotFound` condition.
    pub fn not_found(what: impl Into<String>) -> Self {
        TableError::NotFound { what: what.into() }
    }

    /// Shorthand for an `InvalidDocument` error.
    pub fn invalid_document(detail: impl Into<String>) -> Self {
        TableError::InvalidDocument {
            detail: detail.into(),
        }
    }

    /// `true` for conditions a poller should retry rather than report.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, TableError::NotReady { .. })
    }
}

/// Classification of one failed extraction call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionError {
    /// Timeout, rate limit or transient server error. Worth retrying.
    #[error("transient extraction error: {detail}")]
    Transient {
        detail: String,
        /// Server-specified delay before the next attempt, when known.
        retry_after: Option<Duration>,
    },

    /// Authentication failure, malformed request, content filter. Not retried.
    #[error("permanent extraction error: {detail}")]
    Permanent { detail: String },
}

impl ExtractionError {
    pub fn transient(detail: impl Into<String>) -> Self {
        ExtractionError::Transient {
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        ExtractionError::Permanent {
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractionError::Transient { .. })
    }
}

/// A non-fatal error for a single chunk.
///
/// The chunk contributes zero rows; the page is still assembled from its
/// siblings.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkError {
    /// Extraction call failed after all attempts (or failed permanently).
    #[error("extraction failed after {attempts} attempt(s): {detail}")]
    ExtractionFailed { attempts: u32, detail: String },

    /// The backend answered but the output is not a table.
    #[error("unparseable extraction output: {detail}")]
    ParseFailed { detail: String },

    /// The document was cancelled before this chunk was dispatched.
    #[error("cancelled before dispatch")]
    Cancelled,
}
