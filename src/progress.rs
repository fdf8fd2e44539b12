//! Document status state machine and its atomically published snapshot.
//!
//! Each document owns exactly one [`ProgressTracker`]. The tracker is the only
//! writer of the document's [`ProcessingStatus`]; pollers hold
//! `watch::Receiver`s and always observe a complete value, never a mix of
//! counters from one update and a state from another.
//!
//! ```text
//! Queued ──▶ Processing ──▶ Completed
//!    │            │
//!    └────────────┴──────▶ Failed
//! ```
//!
//! Terminal states accept no further updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Progress reported while a document has not reached a terminal state never
/// exceeds this value, so `1.0` always means `Completed`.
pub const MAX_IN_FLIGHT_PROGRESS: f64 = 0.99;

/// Lifecycle of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl DocumentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentState::Completed | DocumentState::Failed)
    }
}

/// Point-in-time view of a document's processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub document_id: String,
    pub state: DocumentState,
    /// Resolved chunks over total chunks, in `[0, 1]`.
    pub progress: f64,
    /// Page of the most recently resolved chunk.
    pub current_page: Option<usize>,
    /// Index of the most recently resolved chunk.
    pub current_chunk: Option<usize>,
    pub total_pages: usize,
    pub total_chunks: usize,
    pub resolved_chunks: usize,
    pub failed_chunks: usize,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingStatus {
    fn queued(document_id: String, total_pages: usize) -> Self {
        Self {
            document_id,
            state: DocumentState::Queued,
            progress: 0.0,
            current_page: None,
            current_chunk: None,
            total_pages,
            total_chunks: 0,
            resolved_chunks: 0,
            failed_chunks: 0,
            message: None,
            updated_at: Utc::now(),
        }
    }

    /// Progress as a whole percentage, for display.
    pub fn percent(&self) -> u8 {
        (self.progress * 100.0).floor().clamp(0.0, 100.0) as u8
    }
}

/// Single writer of one document's [`ProcessingStatus`].
#[derive(Debug)]
pub struct ProgressTracker {
    tx: watch::Sender<ProcessingStatus>,
}

impl ProgressTracker {
    /// Create a tracker in the `Queued` state.
    pub fn new(document_id: impl Into<String>, total_pages: usize) -> Self {
        let (tx, _rx) = watch::channel(ProcessingStatus::queued(document_id.into(), total_pages));
        Self { tx }
    }

    /// A new reader of this document's status.
    pub fn subscribe(&self) -> watch::Receiver<ProcessingStatus> {
        self.tx.subscribe()
    }

    /// Copy of the current status.
    pub fn snapshot(&self) -> ProcessingStatus {
        self.tx.borrow().clone()
    }

    /// `Queued → Processing`.
    pub fn start_processing(&self) {
        self.update(|s| {
            s.state = DocumentState::Processing;
            s.message = None;
        });
    }

    /// Record the page and chunk totals once chunking is planned.
    pub fn set_totals(&self, total_pages: usize, total_chunks: usize) {
        self.update(|s| {
            s.total_pages = total_pages;
            s.total_chunks = total_chunks;
        });
    }

    /// Count one chunk whose outcome (success or failure) is now known.
    pub fn chunk_resolved(&self, page_number: usize, chunk_index: usize, failed: bool) {
        self.update(|s| {
            s.resolved_chunks += 1;
            if failed {
                s.failed_chunks += 1;
            }
            s.current_page = Some(page_number);
            s.current_chunk = Some(chunk_index);
            let ratio = s.resolved_chunks as f64 / s.total_chunks.max(1) as f64;
            s.progress = s.progress.max(ratio.min(MAX_IN_FLIGHT_PROGRESS));
        });
    }

    /// Replace the human-readable message without touching counters.
    pub fn note(&self, message: Option<String>) {
        self.update(|s| s.message = message);
    }

    /// Clear the message only if it is still the one we set earlier.
    pub fn clear_note(&self, message: &str) {
        self.update(|s| {
            if s.message.as_deref() == Some(message) {
                s.message = None;
            }
        });
    }

    /// `Processing → Completed`; progress becomes exactly `1.0`.
    pub fn complete(&self, message: Option<String>) {
        self.update(|s| {
            s.state = DocumentState::Completed;
            s.progress = 1.0;
            s.current_page = None;
            s.current_chunk = None;
            s.message = message;
        });
    }

    /// Any non-terminal state `→ Failed`. Progress is left where it was.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| {
            s.state = DocumentState::Failed;
            s.current_page = None;
            s.current_chunk = None;
            s.message = Some(message);
        });
    }

    /// Apply `f` and publish, unless the document is already terminal.
    fn update(&self, f: impl FnOnce(&mut ProcessingStatus)) -> bool {
        self.tx.send_if_modified(|status| {
            if status.state.is_terminal() {
                debug!(
                    "Document {}: ignoring update after {:?}",
                    status.document_id, status.state
                );
                return false;
            }
            f(status);
            status.updated_at = Utc::now();
            true
        })
    }
}
