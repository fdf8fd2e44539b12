//! Drives one document from stored PDF to global table.
//!
//! ```text
//! render ─▶ persist pages ─▶ chunk ─▶ dispatch (buffer_unordered) ─┐
//!                                                                    │ per chunk: parse
//!         publish page table ◀─ assemble_page ◀─ all chunks of page ◀┘
//!         publish global     ◀─ assemble_document ◀─ all pages
//! ```
//!
//! Chunk futures only produce their own [`ChunkResult`]; the driver loop owns
//! the per-page slots and assembles a page as soon as its last slot fills.
//! Every chunk outcome advances the [`ProgressTracker`] after the page table
//! it completes (if any) has been published.

use crate::config::ExtractionConfig;
use crate::error::TableError;
use crate::pipeline::assemble::{assemble_document, assemble_page, ChunkOutcome, ChunkResult};
use crate::pipeline::chunk::{slice_page, ChunkImage};
use crate::pipeline::dispatch::Dispatcher;
use crate::pipeline::parse::parse_chunk_output;
use crate::pipeline::render::{render_document, PageRenderer};
use crate::progress::ProgressTracker;
use crate::storage::{self, DocumentPaths};
use crate::table::{GlobalTable, PageTable};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Tables published by the driver, read by pollers.
#[derive(Debug, Default)]
pub struct DocumentOutputs {
    pages: RwLock<BTreeMap<usize, Arc<PageTable>>>,
    global: RwLock<Option<Arc<GlobalTable>>>,
}

impl DocumentOutputs {
    pub fn page(&self, page_number: usize) -> Option<Arc<PageTable>> {
        self.pages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&page_number)
            .cloned()
    }

    pub fn global(&self) -> Option<Arc<GlobalTable>> {
        self.global.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Page tables assembled so far, in page order.
    pub fn pages(&self) -> Vec<Arc<PageTable>> {
        self.pages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn publish_page(&self, table: PageTable) {
        self.pages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.page_number, Arc::new(table));
    }

    fn publish_global(&self, table: GlobalTable) {
        *self.global.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(table));
    }
}

/// Everything the driver needs for one document.
pub struct DocumentJob {
    pub document_id: String,
    pub password: Option<String>,
    pub paths: DocumentPaths,
    pub config: Arc<ExtractionConfig>,
    pub renderer: Arc<dyn PageRenderer>,
    pub dispatcher: Dispatcher,
    pub tracker: Arc<ProgressTracker>,
    pub outputs: Arc<DocumentOutputs>,
    pub cancel: Arc<AtomicBool>,
}

/// Run the document to a terminal state. Never returns an error: failures
/// move the tracker to `Failed` and are written to `raw/error.txt`.
pub async fn run_document(job: DocumentJob) {
    job.tracker.start_processing();
    info!("Document {}: processing started", job.document_id);

    match process(&job).await {
        Ok(message) => {
            info!(
                "Document {}: completed{}",
                job.document_id,
                message.as_deref().map(|m| format!(" ({m})")).unwrap_or_default()
            );
            job.tracker.complete(message);
        }
        Err(e) => {
            let message = e.to_string();
            warn!("Document {}: failed: {}", job.document_id, message);
            if let Err(write_err) = storage::write_bytes(&job.paths.error_file(), &message).await {
                warn!("Could not record failure: {}", write_err);
            }
            job.tracker.fail(message);
        }
    }
}

struct PageWork {
    page_number: usize,
    chunks: Vec<ChunkImage>,
}

/// The pipeline proper; `Ok` carries the completion message.
async fn process(job: &DocumentJob) -> Result<Option<String>, TableError> {
    let config = &job.config;
    let pages = render_document(
        Arc::clone(&job.renderer),
        &job.paths.original_pdf(),
        job.password.as_deref(),
        config.dpi,
        config.max_rendered_pixels,
    )
    .await?;

    let mut work = Vec::with_capacity(pages.len());
    for page in pages {
        if config.save_page_images {
            storage::write_png(&job.paths.page_image(page.page_number), page.image.clone())
                .await?;
        }
        let chunks = slice_page(&page, config.chunk_height, config.chunk_overlap)?;
        if config.save_chunk_images {
            for c in &chunks {
                let path = job.paths.chunk_image(c.span.page_number, c.span.chunk_index);
                if let Err(e) = storage::write_png(&path, c.image.clone()).await {
                    warn!("Could not save chunk image: {}", e);
                }
            }
        }
        work.push(PageWork {
            page_number: page.page_number,
            chunks,
        });
    }

    let total_pages = work.len();
    let total_chunks: usize = work.iter().map(|p| p.chunks.len()).sum();
    job.tracker.set_totals(total_pages, total_chunks);
    info!(
        "Document {}: {} pages → {} chunks",
        job.document_id, total_pages, total_chunks
    );

    let mut expected: HashMap<usize, usize> = HashMap::new();
    let mut slots: HashMap<usize, Vec<ChunkResult>> = HashMap::new();
    for page in &work {
        expected.insert(page.page_number, page.chunks.len());
        if page.chunks.is_empty() {
            publish_page(job, PageTable::empty(page.page_number, 0)).await?;
        }
    }

    // Collected eagerly so the spawned driver future stays `Send`.
    let pending: Vec<_> = work
        .iter()
        .flat_map(|p| {
            p.chunks
                .iter()
                .map(move |c| resolve_chunk(job, c, p.chunks.len()))
        })
        .collect();
    let mut resolved = stream::iter(pending).buffer_unordered(config.concurrency.max(1));

    let mut failed = 0usize;
    let mut first_error: Option<String> = None;
    while let Some(result) = resolved.next().await {
        let span = result.span;
        let is_failed = result.is_failed();
        if is_failed {
            failed += 1;
            if first_error.is_none() {
                if let ChunkOutcome::Failed(e) = &result.outcome {
                    first_error = Some(e.to_string());
                }
            }
        }

        let page_slots = slots.entry(span.page_number).or_default();
        page_slots.push(result);
        if Some(&page_slots.len()) == expected.get(&span.page_number) {
            let table = assemble_page(span.page_number, page_slots);
            if let Some(note) = table.message() {
                warn!("{}", note);
            }
            publish_page(job, table).await?;
        }
        job.tracker
            .chunk_resolved(span.page_number, span.chunk_index, is_failed);
    }
    drop(resolved);

    if job.cancel.load(Ordering::Acquire) {
        return Err(TableError::Cancelled);
    }
    if total_chunks > 0 && failed == total_chunks {
        return Err(TableError::AllChunksFailed {
            total: total_chunks,
            first_error: first_error.unwrap_or_default(),
        });
    }

    let page_tables: Vec<PageTable> = job
        .outputs
        .pages()
        .iter()
        .map(|p| p.as_ref().clone())
        .collect();
    let global = assemble_document(&page_tables);
    storage::write_json(&job.paths.global_table(), &global).await?;
    info!(
        "Document {}: global table has {} rows",
        job.document_id,
        global.rows.len()
    );

    let message = completion_message(&page_tables, &global, failed, total_chunks);
    job.outputs.publish_global(global);
    Ok(message)
}

/// Dispatch, persist raw output when asked, then parse.
async fn resolve_chunk(job: &DocumentJob, chunk: &ChunkImage, chunk_count: usize) -> ChunkResult {
    let dispatched = job
        .dispatcher
        .dispatch_chunk(chunk, chunk_count, &job.tracker, &job.cancel)
        .await;
    let span = dispatched.span;

    let raw = match dispatched.result {
        Ok(raw) => raw,
        Err(e) => return ChunkResult::failed(span, e),
    };

    if job.config.save_raw_output {
        let path = job.paths.raw_output(span.page_number, span.chunk_index);
        if let Err(e) = storage::write_bytes(&path, &raw).await {
            warn!("Could not save raw output: {}", e);
        }
    }

    match parse_chunk_output(&raw, &span, chunk.image.width()) {
        Ok(parsed) => {
            debug!(
                "Page {} chunk {}: {} rows",
                span.page_number,
                span.chunk_index,
                parsed.rows.len()
            );
            ChunkResult::parsed(span, parsed)
        }
        Err(e) => {
            warn!(
                "Page {} chunk {}: {}",
                span.page_number, span.chunk_index, e
            );
            ChunkResult::failed(span, e)
        }
    }
}

async fn publish_page(job: &DocumentJob, table: PageTable) -> Result<(), TableError> {
    storage::write_json(&job.paths.page_table(table.page_number), &table).await?;
    job.outputs.publish_page(table);
    Ok(())
}

fn completion_message(
    pages: &[PageTable],
    global: &GlobalTable,
    failed: usize,
    total: usize,
) -> Option<String> {
    let mut parts = Vec::new();
    if failed > 0 {
        let degraded: Vec<String> = pages
            .iter()
            .filter(|p| p.is_degraded())
            .map(|p| p.page_number.to_string())
            .collect();
        parts.push(format!(
            "{failed} of {total} chunks dropped (pages {})",
            degraded.join(", ")
        ));
    }
    if !global.header_mismatch_pages.is_empty() {
        let pages: Vec<String> = global
            .header_mismatch_pages
            .iter()
            .map(usize::to_string)
            .collect();
        parts.push(format!("header differs on pages {}", pages.join(", ")));
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}
