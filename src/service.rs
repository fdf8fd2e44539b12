//! The polling API: create documents, watch them progress, read results.
//!
//! [`ExtractionService`] owns the document registry and the process-wide
//! extraction limiter. Each created document runs on its own Tokio task;
//! every read goes through the document's published snapshots, so pollers
//! never block the pipeline.
//!
//! ```rust,no_run
//! use edgequake_pdf2table::{ExportFormat, ExportRequest, ExtractionConfig, ExtractionService};
//!
//! # async fn run() -> Result<(), edgequake_pdf2table::TableError> {
//! let service = ExtractionService::from_config(ExtractionConfig::default())?;
//! let created = service.create_from_input("invoice.pdf", None).await?;
//! service.wait_for_completion(&created.document_id).await?;
//! let csv = service
//!     .export(&created.document_id, ExportRequest { format: ExportFormat::Csv, include_confidence: true })
//!     .await?;
//! std::fs::write(&csv.filename, &csv.bytes).ok();
//! # Ok(())
//! # }
//! ```

use crate::config::ExtractionConfig;
use crate::error::TableError;
use crate::export::{export_table, ExportArtifact, ExportRequest};
use crate::pipeline::dispatch::{Dispatcher, RetryPolicy};
use crate::pipeline::input::{load_input, LoadedInput};
use crate::pipeline::llm::{ExtractionBackend, VisionBackend};
use crate::pipeline::render::{count_pages, PageRenderer, PdfiumRenderer};
use crate::process::{run_document, DocumentJob, DocumentOutputs};
use crate::progress::{DocumentState, ProcessingStatus, ProgressTracker};
use crate::storage::{self, DocumentPaths, DocumentStore};
use crate::table::{GlobalTable, PageTable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

/// Returned by document creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedDocument {
    pub document_id: String,
    pub filename: String,
    pub page_count: usize,
    pub state: DocumentState,
    pub created_at: DateTime<Utc>,
}

/// Registry entry of one document.
pub struct DocumentRecord {
    pub document_id: String,
    pub filename: String,
    pub page_count: usize,
    pub created_at: DateTime<Utc>,
    paths: DocumentPaths,
    tracker: Arc<ProgressTracker>,
    outputs: Arc<DocumentOutputs>,
    cancel: Arc<AtomicBool>,
}

impl DocumentRecord {
    fn check_page(&self, page_number: usize) -> Result<(), TableError> {
        if page_number == 0 || page_number > self.page_count {
            return Err(TableError::not_found(format!(
                "Page {page_number} of document {} ({} pages)",
                self.document_id, self.page_count
            )));
        }
        Ok(())
    }
}

/// Entry point for table extraction.
pub struct ExtractionService {
    config: Arc<ExtractionConfig>,
    store: DocumentStore,
    renderer: Arc<dyn PageRenderer>,
    backend: Arc<dyn ExtractionBackend>,
    limiter: Arc<Semaphore>,
    documents: RwLock<HashMap<String, Arc<DocumentRecord>>>,
}

impl ExtractionService {
    /// Build a service with explicit collaborators.
    pub fn new(
        config: ExtractionConfig,
        renderer: Arc<dyn PageRenderer>,
        backend: Arc<dyn ExtractionBackend>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            store: DocumentStore::new(config.storage_dir.clone()),
            config: Arc::new(config),
            renderer,
            backend,
            limiter,
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// pdfium from `PDFIUM_LIB_PATH` and the LLM provider resolved from the
    /// config or environment.
    pub fn from_config(config: ExtractionConfig) -> Result<Self, TableError> {
        config.validate()?;
        let backend = VisionBackend::from_config(&config)?;
        Ok(Self::new(
            config,
            Arc::new(PdfiumRenderer::from_env()),
            Arc::new(backend),
        ))
    }

    /// Share `limiter` with other services instead of owning one.
    pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Load a local path or URL and create a document from it.
    pub async fn create_from_input(
        &self,
        input: &str,
        password: Option<String>,
    ) -> Result<CreatedDocument, TableError> {
        let loaded = load_input(input, self.config.download_timeout_secs).await?;
        self.create_document(loaded, password).await
    }

    /// Store the PDF, validate that it opens, and start processing.
    ///
    /// # Errors
    /// [`TableError::InvalidDocument`] when the bytes are not a PDF, the file
    /// is unreadable, or the password is wrong or missing. Nothing is
    /// registered in that case.
    pub async fn create_document(
        &self,
        input: LoadedInput,
        password: Option<String>,
    ) -> Result<CreatedDocument, TableError> {
        let document_id = Uuid::new_v4().simple().to_string();
        let paths = self.store.document(&document_id);
        storage::write_bytes(&paths.original_pdf(), &input.bytes).await?;

        let page_count = match count_pages(
            Arc::clone(&self.renderer),
            &paths.original_pdf(),
            password.as_deref(),
        )
        .await
        {
            Ok(n) => n,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(paths.dir()).await {
                    warn!("Could not remove '{}': {}", paths.dir().display(), cleanup);
                }
                return Err(e);
            }
        };

        let created_at = Utc::now();
        let tracker = Arc::new(ProgressTracker::new(&document_id, page_count));
        let record = Arc::new(DocumentRecord {
            document_id: document_id.clone(),
            filename: input.filename.clone(),
            page_count,
            created_at,
            paths: paths.clone(),
            tracker: Arc::clone(&tracker),
            outputs: Arc::new(DocumentOutputs::default()),
            cancel: Arc::new(AtomicBool::new(false)),
        });

        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.clone(), Arc::clone(&record));

        let job = DocumentJob {
            document_id: document_id.clone(),
            password,
            paths,
            config: Arc::clone(&self.config),
            renderer: Arc::clone(&self.renderer),
            dispatcher: Dispatcher::new(
                Arc::clone(&self.backend),
                Arc::clone(&self.limiter),
                RetryPolicy::from_config(&self.config),
            ),
            tracker,
            outputs: Arc::clone(&record.outputs),
            cancel: Arc::clone(&record.cancel),
        };
        tokio::spawn(run_document(job));

        info!(
            "Created document {} ('{}', {} pages)",
            document_id, input.filename, page_count
        );
        Ok(CreatedDocument {
            document_id,
            filename: input.filename,
            page_count,
            state: DocumentState::Queued,
            created_at,
        })
    }

    /// Look up a registered document.
    pub fn document(&self, document_id: &str) -> Result<Arc<DocumentRecord>, TableError> {
        self.documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_id)
            .cloned()
            .ok_or_else(|| TableError::not_found(format!("Document {document_id}")))
    }

    /// Current status snapshot.
    pub fn status(&self, document_id: &str) -> Result<ProcessingStatus, TableError> {
        Ok(self.document(document_id)?.tracker.snapshot())
    }

    /// A receiver that observes every published status snapshot.
    pub fn subscribe(
        &self,
        document_id: &str,
    ) -> Result<watch::Receiver<ProcessingStatus>, TableError> {
        Ok(self.document(document_id)?.tracker.subscribe())
    }

    /// PNG bytes of a rendered page.
    pub async fn page_image(
        &self,
        document_id: &str,
        page_number: usize,
    ) -> Result<Vec<u8>, TableError> {
        let record = self.document(document_id)?;
        record.check_page(page_number)?;
        if !self.config.save_page_images {
            return Err(TableError::not_found(format!(
                "Image of page {page_number} (page images are not persisted)"
            )));
        }

        let path = record.paths.page_image(page_number);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return storage::read_bytes(&path).await;
        }
        match record.tracker.snapshot().state {
            DocumentState::Failed => Err(TableError::not_found(format!(
                "Image of page {page_number} (document failed)"
            ))),
            _ => Err(TableError::not_ready(format!("Image of page {page_number}"))),
        }
    }

    /// The assembled table of one page; `NotReady` until all its chunks
    /// have resolved.
    pub fn page_table(
        &self,
        document_id: &str,
        page_number: usize,
    ) -> Result<Arc<PageTable>, TableError> {
        let record = self.document(document_id)?;
        record.check_page(page_number)?;
        if let Some(table) = record.outputs.page(page_number) {
            return Ok(table);
        }
        match record.tracker.snapshot().state {
            DocumentState::Failed => Err(TableError::not_found(format!(
                "Table for page {page_number} (document failed)"
            ))),
            _ => Err(TableError::not_ready(format!("Table for page {page_number}"))),
        }
    }

    /// The document-wide table; available once the document is `Completed`.
    pub fn global_table(&self, document_id: &str) -> Result<Arc<GlobalTable>, TableError> {
        let record = self.document(document_id)?;
        match record.tracker.snapshot().state {
            DocumentState::Completed => record
                .outputs
                .global()
                .ok_or_else(|| TableError::Internal("completed without a global table".into())),
            DocumentState::Failed => Err(TableError::not_found(format!(
                "Global table of document {document_id} (document failed)"
            ))),
            _ => Err(TableError::not_ready("Global table")),
        }
    }

    /// Render the global table and keep a copy under `exports/`.
    pub async fn export(
        &self,
        document_id: &str,
        request: ExportRequest,
    ) -> Result<ExportArtifact, TableError> {
        let table = self.global_table(document_id)?;
        let artifact = export_table(document_id, &table, request)?;
        let record = self.document(document_id)?;
        storage::write_bytes(&record.paths.export_file(&artifact.filename), &artifact.bytes)
            .await?;
        info!(
            "Exported document {} as {} ({} bytes)",
            document_id,
            request.format,
            artifact.bytes.len()
        );
        Ok(artifact)
    }

    /// Wait until the document reaches `Completed` or `Failed`.
    pub async fn wait_for_completion(
        &self,
        document_id: &str,
    ) -> Result<ProcessingStatus, TableError> {
        let mut rx = self.subscribe(document_id)?;
        let status = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map_err(|_| TableError::Internal("status channel closed".into()))?
            .clone();
        Ok(status)
    }

    /// Ask the document to stop dispatching new chunks. Chunks already in a
    /// backend call finish; the document ends `Failed`.
    pub fn cancel(&self, document_id: &str) -> Result<(), TableError> {
        let record = self.document(document_id)?;
        if !record.tracker.snapshot().state.is_terminal() {
            record.cancel.store(true, Ordering::Release);
            info!("Cancellation requested for document {}", document_id);
        }
        Ok(())
    }
}
