//! Embedding worker: hosts the model off the main execution context.
//!
//! One long-lived thread owns the model. The main side communicates over
//! channels with correlation identifiers; a 30 s startup window and a 30 s
//! per-request timeout bound tail latency, with timed-out requests resolving
//! to `None` so callers treat the row as "try again next cycle".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::acquire_handle_lock;

/// Startup window before the handle reports unavailable.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request timeout; expired requests resolve to `None`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for the worker to exit after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Requests sent to the worker thread.
enum Request {
    /// Embed a batch of texts under a correlation id.
    Embed { id: u64, texts: Vec<String> },
    /// Stop the worker.
    Shutdown,
}

/// Replies from the worker thread.
///
/// Only the feature-gated worker constructs these; the handle side always
/// compiles the receive paths.
#[cfg_attr(not(feature = "fastembed-embeddings"), allow(dead_code))]
enum Reply {
    /// The model loaded.
    Ready { engine: String, dimensions: usize },
    /// The model could not be loaded.
    Failed { cause: String },
    /// Result for one correlated request; `None` on embedding failure.
    Batch { id: u64, vectors: Option<Vec<Vec<f32>>> },
}

/// Readiness as seen through the handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Still inside the startup window.
    Pending,
    /// Model loaded and serving.
    Ready {
        /// Engine name, recorded on embedded observations.
        engine: String,
        /// Vector dimensions reported by the model.
        dimensions: usize,
    },
    /// Model absent or failed to load; the pipeline runs keyword-only.
    Unavailable,
}

enum HandleState {
    #[cfg_attr(not(feature = "fastembed-embeddings"), allow(dead_code))]
    Pending { since: Instant },
    Ready { engine: String, dimensions: usize },
    Unavailable,
}

/// Main-side handle to the embedding worker.
///
/// All methods degrade to `None` rather than erroring: embedding is an
/// enrichment, and its failures must never surface to users.
pub struct EmbeddingHandle {
    tx: Option<Sender<Request>>,
    rx: Mutex<Option<Receiver<Reply>>>,
    state: Mutex<HandleState>,
    next_id: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddingHandle {
    /// Spawns the worker thread hosting the model.
    ///
    /// Without the `fastembed-embeddings` feature this returns a disabled
    /// handle and the engine runs keyword-only.
    #[must_use]
    pub fn spawn() -> Self {
        #[cfg(feature = "fastembed-embeddings")]
        {
            Self::spawn_fastembed()
        }
        #[cfg(not(feature = "fastembed-embeddings"))]
        {
            tracing::info!("embedding model not compiled in; running keyword-only");
            Self::disabled()
        }
    }

    /// A handle that reports unavailable and resolves every request to `None`.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            rx: Mutex::new(None),
            state: Mutex::new(HandleState::Unavailable),
            next_id: AtomicU64::new(1),
            join: Mutex::new(None),
        }
    }

    #[cfg(feature = "fastembed-embeddings")]
    fn spawn_fastembed() -> Self {
        use super::Embedder;
        use super::fastembed::FastEmbedEmbedder;
        use std::sync::mpsc::channel;

        let (req_tx, req_rx) = channel::<Request>();
        let (reply_tx, reply_rx) = channel::<Reply>();

        let join = std::thread::Builder::new()
            .name("laminark-embedding".to_string())
            .spawn(move || {
                let embedder = match FastEmbedEmbedder::load() {
                    Ok(embedder) => {
                        let _ = reply_tx.send(Reply::Ready {
                            engine: embedder.model_name().to_string(),
                            dimensions: embedder.dimensions(),
                        });
                        embedder
                    },
                    Err(e) => {
                        let _ = reply_tx.send(Reply::Failed { cause: e.to_string() });
                        return;
                    },
                };

                while let Ok(request) = req_rx.recv() {
                    match request {
                        Request::Embed { id, texts } => {
                            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                            let vectors = embedder.embed_batch(&refs).ok();
                            if reply_tx.send(Reply::Batch { id, vectors }).is_err() {
                                break;
                            }
                        },
                        Request::Shutdown => break,
                    }
                }
            })
            .ok();

        match join {
            Some(join) => Self {
                tx: Some(req_tx),
                rx: Mutex::new(Some(reply_rx)),
                state: Mutex::new(HandleState::Pending { since: Instant::now() }),
                next_id: AtomicU64::new(1),
                join: Mutex::new(Some(join)),
            },
            None => Self::disabled(),
        }
    }

    /// Current readiness, draining any pending status replies first.
    pub fn status(&self) -> WorkerStatus {
        self.poll_state(Duration::ZERO);
        match &*acquire_handle_lock(&self.state) {
            HandleState::Pending { .. } => WorkerStatus::Pending,
            HandleState::Ready { engine, dimensions } => WorkerStatus::Ready {
                engine: engine.clone(),
                dimensions: *dimensions,
            },
            HandleState::Unavailable => WorkerStatus::Unavailable,
        }
    }

    /// Returns true once the worker reported ready.
    pub fn is_ready(&self) -> bool {
        matches!(self.status(), WorkerStatus::Ready { .. })
    }

    /// The engine name, once ready.
    pub fn model_name(&self) -> Option<String> {
        match self.status() {
            WorkerStatus::Ready { engine, .. } => Some(engine),
            _ => None,
        }
    }

    /// Embeds one text; `None` on timeout, failure, or unavailability.
    pub fn embed(&self, text: &str) -> Option<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .and_then(|mut batch| batch.pop())
    }

    /// Embeds a batch; `None` on timeout, failure, or unavailability.
    pub fn embed_batch(&self, texts: &[String]) -> Option<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Some(Vec::new());
        }
        if !self.wait_ready() {
            return None;
        }
        let tx = self.tx.as_ref()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tx.send(Request::Embed { id, texts: texts.to_vec() }).ok()?;

        let deadline = Instant::now() + REQUEST_TIMEOUT;
        let rx_guard = acquire_handle_lock(&self.rx);
        let rx = rx_guard.as_ref()?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                metrics::counter!("laminark_embedding_timeouts_total").increment(1);
                tracing::warn!("embedding request timed out");
                return None;
            }
            match rx.recv_timeout(remaining) {
                Ok(Reply::Batch { id: reply_id, vectors }) if reply_id == id => return vectors,
                // Stale reply from a previously timed-out request; discard.
                Ok(Reply::Batch { .. }) => {},
                Ok(Reply::Ready { engine, dimensions }) => {
                    *acquire_handle_lock(&self.state) = HandleState::Ready { engine, dimensions };
                },
                Ok(Reply::Failed { cause }) => {
                    tracing::warn!(cause, "embedding worker failed");
                    *acquire_handle_lock(&self.state) = HandleState::Unavailable;
                    return None;
                },
                Err(RecvTimeoutError::Timeout) => {
                    metrics::counter!("laminark_embedding_timeouts_total").increment(1);
                    return None;
                },
                Err(RecvTimeoutError::Disconnected) => {
                    *acquire_handle_lock(&self.state) = HandleState::Unavailable;
                    return None;
                },
            }
        }
    }

    /// Requests shutdown and waits up to the grace period before detaching.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Request::Shutdown);
        }
        let mut join_guard = acquire_handle_lock(&self.join);
        if let Some(join) = join_guard.take() {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while !join.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
            if join.is_finished() {
                let _ = join.join();
            } else {
                // Threads cannot be force-killed; detaching is the
                // force-terminate of last resort.
                tracing::warn!("embedding worker did not stop within grace period, detaching");
                drop(join);
            }
        }
    }

    /// Waits for readiness inside the startup window.
    fn wait_ready(&self) -> bool {
        let waited = {
            match &*acquire_handle_lock(&self.state) {
                HandleState::Ready { .. } => return true,
                HandleState::Unavailable => return false,
                HandleState::Pending { since } => since.elapsed(),
            }
        };
        let remaining = STARTUP_TIMEOUT.saturating_sub(waited);
        self.poll_state(remaining);
        match &*acquire_handle_lock(&self.state) {
            HandleState::Ready { .. } => true,
            HandleState::Unavailable => false,
            HandleState::Pending { .. } => {
                // Startup window exhausted.
                *acquire_handle_lock(&self.state) = HandleState::Unavailable;
                tracing::warn!("embedding worker startup timed out; running keyword-only");
                false
            },
        }
    }

    /// Drains status replies, blocking at most `wait`.
    fn poll_state(&self, wait: Duration) {
        let rx_guard = acquire_handle_lock(&self.rx);
        let Some(rx) = rx_guard.as_ref() else { return };
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = if remaining.is_zero() {
                rx.try_recv().ok()
            } else {
                rx.recv_timeout(remaining).ok()
            };
            match received {
                Some(Reply::Ready { engine, dimensions }) => {
                    *acquire_handle_lock(&self.state) = HandleState::Ready { engine, dimensions };
                    return;
                },
                Some(Reply::Failed { cause }) => {
                    tracing::warn!(cause, "embedding worker failed to start");
                    *acquire_handle_lock(&self.state) = HandleState::Unavailable;
                    return;
                },
                Some(Reply::Batch { .. }) => {},
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_handle_reports_unavailable() {
        let handle = EmbeddingHandle::disabled();
        assert_eq!(handle.status(), WorkerStatus::Unavailable);
        assert!(!handle.is_ready());
        assert!(handle.model_name().is_none());
    }

    #[test]
    fn disabled_handle_resolves_requests_to_none() {
        let handle = EmbeddingHandle::disabled();
        assert!(handle.embed("anything").is_none());
        assert!(handle.embed_batch(&["a".to_string(), "b".to_string()]).is_none());
    }

    #[test]
    fn empty_batch_short_circuits() {
        let handle = EmbeddingHandle::disabled();
        assert_eq!(handle.embed_batch(&[]), Some(Vec::new()));
    }

    #[test]
    fn shutdown_is_safe_without_worker() {
        let handle = EmbeddingHandle::disabled();
        handle.shutdown();
        handle.shutdown();
    }
}
