//! Pipeline stages for PDF table extraction.
//!
//! Each submodule implements exactly one transformation step, so each is
//! independently testable and the two external collaborators (renderer and
//! extraction backend) sit behind traits.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ chunk ──▶ dispatch ──▶ parse ──▶ assemble
//! (path/URL) (pdfium)  (bands)   (VLM+retry)  (rows)    (page, document)
//! ```
//!
//! 1. [`input`]: load the user-supplied path or URL, check `%PDF` magic
//! 2. [`render`]: rasterise pages on the blocking pool
//! 3. [`chunk`]: cut tall pages into overlapping vertical bands
//! 4. [`dispatch`]: drive each band through the backend with a process-wide
//!    concurrency ceiling and retry/backoff; [`llm`] and [`encode`] make the
//!    actual call
//! 5. [`parse`]: turn raw backend output into rows with bbox and confidence
//! 6. [`assemble`]: merge chunks into page tables, pages into the global table

pub mod assemble;
pub mod chunk;
pub mod dispatch;
pub mod encode;
pub mod input;
pub mod llm;
pub mod parse;
pub mod render;
