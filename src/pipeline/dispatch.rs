//! Extraction dispatch: concurrency ceiling, per-call timeout, retry/backoff.
//!
//! ## Retry Strategy
//!
//! Rate limits and gateway errors are frequent when many chunks are in flight.
//! A transient failure is retried after `retry_backoff_ms * 2^(k-1)` for retry
//! `k`, capped at `max_backoff_ms`. When the provider names a delay ("retry in
//! 31.2s", `Retry-After`) that delay is used instead, under the same cap.
//! Permanent failures are not retried.
//!
//! ## Concurrency
//!
//! The [`Semaphore`] is owned by the service and shared by every document, so
//! the ceiling holds process-wide. A permit covers exactly one backend call;
//! it is released before a backoff sleep so waiting chunks do not starve the
//! others.

use crate::config::ExtractionConfig;
use crate::error::{ChunkError, ExtractionError};
use crate::pipeline::chunk::{ChunkImage, ChunkSpan};
use crate::pipeline::llm::ExtractionBackend;
use crate::progress::ProgressTracker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Bounded-attempts retry policy for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for a single backend call.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            call_timeout: Duration::from_secs(config.api_timeout_secs.max(1)),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let computed = || {
            let factor = 2u32.saturating_pow(retry.saturating_sub(1));
            self.base_backoff.saturating_mul(factor)
        };
        hint.unwrap_or_else(computed).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExtractionConfig::default())
    }
}

/// The resolution of one chunk's dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub span: ChunkSpan,
    /// Backend calls actually made.
    pub attempts: u32,
    /// Raw backend output, or why the chunk was given up on.
    pub result: Result<String, ChunkError>,
}

/// Drives chunks through an [`ExtractionBackend`].
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn ExtractionBackend>,
    limiter: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn ExtractionBackend>,
        limiter: Arc<Semaphore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            limiter,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Extract one chunk, retrying transient failures.
    ///
    /// Never returns an error: a chunk that cannot be extracted resolves to
    /// `Err` in [`Dispatched::result`] and its siblings carry on. `cancel` is
    /// checked before every attempt.
    pub async fn dispatch_chunk(
        &self,
        chunk: &ChunkImage,
        chunk_count: usize,
        tracker: &ProgressTracker,
        cancel: &AtomicBool,
    ) -> Dispatched {
        let span = chunk.span;
        let mut retry_note: Option<String> = None;
        let mut attempt = 0u32;

        let result = loop {
            if cancel.load(Ordering::Acquire) {
                break Err(ChunkError::Cancelled);
            }
            attempt += 1;

            let outcome = {
                let _permit = match self.limiter.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => break Err(ChunkError::Cancelled),
                };
                match timeout(self.policy.call_timeout, self.backend.extract(chunk, chunk_count))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ExtractionError::transient(format!(
                        "call timed out after {:?}",
                        self.policy.call_timeout
                    ))),
                }
            };

            match outcome {
                Ok(raw) => {
                    if let Some(note) = retry_note.take() {
                        tracker.clear_note(&note);
                    }
                    debug!(
                        "Page {} chunk {}: extracted on attempt {}",
                        span.page_number, span.chunk_index, attempt
                    );
                    break Ok(raw);
                }
                Err(ExtractionError::Transient {
                    detail,
                    retry_after,
                }) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt, retry_after);
                    warn!(
                        "Page {} chunk {}: attempt {}/{} failed ({}), retrying in {}ms",
                        span.page_number,
                        span.chunk_index,
                        attempt,
                        self.policy.max_attempts,
                        detail,
                        delay.as_millis()
                    );
                    let note = format!(
                        "Page {} chunk {}: retry {}/{} in {:.1}s",
                        span.page_number,
                        span.chunk_index,
                        attempt,
                        self.policy.max_attempts - 1,
                        delay.as_secs_f64()
                    );
                    tracker.note(Some(note.clone()));
                    retry_note = Some(note);
                    sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        "Page {} chunk {}: giving up after {} attempt(s): {}",
                        span.page_number, span.chunk_index, attempt, e
                    );
                    let detail = match e {
                        ExtractionError::Transient { detail, .. }
                        | ExtractionError::Permanent { detail } => detail,
                    };
                    break Err(ChunkError::ExtractionFailed {
                        attempts: attempt,
                        detail,
                    });
                }
            }
        };

        if result.is_err() {
            if let Some(note) = retry_note {
                tracker.clear_note(&note);
            }
        }

        Dispatched {
            span,
            attempts: attempt,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use image::DynamicImage;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Replays a script of outcomes, then succeeds.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, ExtractionError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, ExtractionError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExtractionBackend for Scripted {
        async fn extract(&self, _: &ChunkImage, _: usize) -> Result<String, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok("ok".to_string()))
        }
    }

    fn chunk(index: usize) -> ChunkImage {
        ChunkImage {
            span: ChunkSpan {
                page_number: 1,
                chunk_index: index,
                y0: 0,
                y1: 10,
            },
            image: DynamicImage::new_rgb8(4, 10),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn dispatcher(backend: Arc<dyn ExtractionBackend>, permits: usize, attempts: u32) -> Dispatcher {
        Dispatcher::new(backend, Arc::new(Semaphore::new(permits)), fast_policy(attempts))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3000),
            call_timeout: Duration::from_secs(1),
        };
        let delays: Vec<u128> = (1..=5).map(|k| policy.delay_for(k, None).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(1200))),
            Duration::from_millis(1200)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(60))),
            Duration::from_millis(3000)
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = Arc::new(Scripted::new(vec![
            Err(ExtractionError::transient("429")),
            Err(ExtractionError::transient("503")),
        ]));
        let d = dispatcher(backend.clone(), 1, 3);
        let tracker = ProgressTracker::new("doc", 1);
        let out = d.dispatch_chunk(&chunk(0), 1, &tracker, &AtomicBool::new(false)).await;
        assert_eq!(out.result, Ok("ok".to_string()));
        assert_eq!(out.attempts, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.snapshot().message, None, "retry note cleared on success");
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_chunk() {
        let backend = Arc::new(Scripted::new(vec![
            Err(ExtractionError::transient("429")),
            Err(ExtractionError::transient("429")),
        ]));
        let d = dispatcher(backend.clone(), 1, 2);
        let tracker = ProgressTracker::new("doc", 1);
        let out = d.dispatch_chunk(&chunk(0), 1, &tracker, &AtomicBool::new(false)).await;
        assert_eq!(
            out.result,
            Err(ChunkError::ExtractionFailed {
                attempts: 2,
                detail: "429".into()
            })
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let backend = Arc::new(Scripted::new(vec![Err(ExtractionError::permanent("401"))]));
        let d = dispatcher(backend.clone(), 1, 5);
        let tracker = ProgressTracker::new("doc", 1);
        let out = d.dispatch_chunk(&chunk(0), 1, &tracker, &AtomicBool::new(false)).await;
        assert!(matches!(out.result, Err(ChunkError::ExtractionFailed { attempts: 1, .. })));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_chunks_make_no_calls() {
        let backend = Arc::new(Scripted::new(vec![]));
        let d = dispatcher(backend.clone(), 1, 3);
        let tracker = ProgressTracker::new("doc", 1);
        let out = d.dispatch_chunk(&chunk(0), 1, &tracker, &AtomicBool::new(true)).await;
        assert_eq!(out.result, Err(ChunkError::Cancelled));
        assert_eq!(out.attempts, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    struct Slow {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ExtractionBackend for Slow {
        async fn extract(&self, _: &ChunkImage, _: usize) -> Result<String, ExtractionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn limiter_bounds_in_flight_calls() {
        let backend = Arc::new(Slow {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let d = dispatcher(backend.clone(), 2, 1);
        let tracker = ProgressTracker::new("doc", 1);
        let cancel = AtomicBool::new(false);
        let chunks: Vec<ChunkImage> = (0..8).map(chunk).collect();

        let results: Vec<Dispatched> = stream::iter(chunks.iter())
            .map(|c| d.dispatch_chunk(c, 8, &tracker, &cancel))
            .buffer_unordered(8)
            .collect()
            .await;

        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.result.is_ok()));
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    struct Hangs;

    #[async_trait]
    impl ExtractionBackend for Hangs {
        async fn extract(&self, _: &ChunkImage, _: usize) -> Result<String, ExtractionError> {
            sleep(Duration::from_secs(30)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn timeouts_count_as_transient() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(20),
            ..fast_policy(2)
        };
        let d = Dispatcher::new(Arc::new(Hangs), Arc::new(Semaphore::new(1)), policy);
        let tracker = ProgressTracker::new("doc", 1);
        let out = d.dispatch_chunk(&chunk(0), 1, &tracker, &AtomicBool::new(false)).await;
        match out.result {
            Err(ChunkError::ExtractionFailed { attempts, detail }) => {
                assert_eq!(attempts, 2);
                assert_eq!(detail, "call timed out after 20ms");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
