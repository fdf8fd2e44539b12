//! Streaming status API: emit status snapshots as a document progresses.
//!
//! ## Why stream?
//!
//! Large documents take minutes. A stream lets callers drive progress bars or
//! push updates to clients without a polling loop. The stream yields the
//! current snapshot first, then every change, and ends right after the first
//! terminal snapshot (`Completed` or `Failed`).
//!
//! Snapshots come from a `watch` channel, so a slow consumer sees the latest
//! state rather than every intermediate one; progress is still
//! non-decreasing across the items it does see.

use crate::error::TableError;
use crate::progress::ProcessingStatus;
use crate::service::ExtractionService;
use futures::stream;
use std::pin::Pin;
use tokio::sync::watch;
use tokio_stream::Stream;

/// A boxed stream of status snapshots.
pub type StatusStream = Pin<Box<dyn Stream<Item = ProcessingStatus> + Send>>;

/// Stream the status of `document_id` until it reaches a terminal state.
///
/// # Errors
/// [`TableError::NotFound`] for an unknown document.
pub fn status_stream(
    service: &ExtractionService,
    document_id: &str,
) -> Result<StatusStream, TableError> {
    Ok(watch_until_terminal(service.subscribe(document_id)?))
}

/// Turn a status receiver into a stream that ends with the terminal snapshot.
///
/// The stream also ends if the writer goes away first.
pub fn watch_until_terminal(rx: watch::Receiver<ProcessingStatus>) -> StatusStream {
    Box::pin(stream::unfold(Some((rx, false)), |cursor| async move {
        let (mut rx, started) = cursor?;
        if started && rx.changed().await.is_err() {
            return None;
        }
        let status = rx.borrow_and_update().clone();
        let next = (!status.state.is_terminal()).then_some((rx, true));
        Some((status, next))
    }))
}
