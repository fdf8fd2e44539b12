//! # edgequake-pdf2table
//!
//! Extract tables from PDF documents using Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Scanned statements, invoices and reports carry their data in tables that
//! text extractors flatten into an unordered soup of numbers. Instead this
//! crate rasterises each page, cuts tall pages into overlapping horizontal
//! bands, and lets a VLM transcribe the rows of each band. The bands are then
//! stitched back together, deduplicated where they overlap, and reconciled
//! into one table for the whole document.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     load a local file or download from URL, check %PDF
//!  ├─ 2. Render    rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Chunk     overlapping vertical bands per page
//!  ├─ 4. Dispatch  bounded-concurrency VLM calls with retry/backoff
//!  ├─ 5. Parse     JSON or pipe-table output → rows with bbox + confidence
//!  ├─ 6. Assemble  per-page tables (overlap dedup), then the global table
//!  └─ 7. Export    CSV / JSON
//! ```
//!
//! Progress is published as immutable [`ProcessingStatus`] snapshots through a
//! `tokio::sync::watch` channel; page tables become readable as soon as their
//! last chunk resolves.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2table::{ExportRequest, ExtractionConfig, ExtractionService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let service = ExtractionService::from_config(ExtractionConfig::default())?;
//!     let doc = service.create_from_input("statement.pdf", None).await?;
//!     let status = service.wait_for_completion(&doc.document_id).await?;
//!     eprintln!("{:?}: {}", status.state, status.message.unwrap_or_default());
//!
//!     let csv = service.export(&doc.document_id, ExportRequest::default()).await?;
//!     std::fs::write(&csv.filename, &csv.bytes)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2table` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-pdf2table = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod service;
pub mod storage;
pub mod stream;
pub mod table;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use error::{ChunkError, ExtractionError, TableError};
pub use export::{export_table, ExportArtifact, ExportFormat, ExportRequest};
pub use pipeline::assemble::{assemble_document, assemble_page, ChunkOutcome, ChunkResult};
pub use pipeline::chunk::{plan_chunks, ChunkImage, ChunkSpan};
pub use pipeline::input::LoadedInput;
pub use pipeline::llm::{ExtractionBackend, VisionBackend};
pub use pipeline::render::{PageRenderer, PdfiumRenderer, RenderedPage};
pub use progress::{DocumentState, ProcessingStatus, ProgressTracker};
pub use service::{CreatedDocument, ExtractionService};
pub use stream::{status_stream, StatusStream};
pub use table::{BoundingBox, DroppedChunk, GlobalRow, GlobalTable, PageTable, Row};
