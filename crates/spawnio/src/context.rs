//! Serial execution contexts for callback delivery.
//!
//! An [`ExecutionContext`] is a FIFO of jobs drained by a single Tokio task, so
//! jobs dispatched to it run one at a time and in submission order. Every
//! [`crate::Stream`] and every process exit monitor delivers its callbacks
//! through one. Cloning a context shares the queue, which is how callers force
//! serialization between several objects.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct ExecutionContext {
    label: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
    handle: Handle,
}

impl ExecutionContext {
    /// Create a context backed by a new task on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime, like `tokio::spawn`.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_handle(label, Handle::current())
    }

    pub fn with_handle(label: impl Into<String>, handle: Handle) -> Self {
        let label: Arc<str> = Arc::from(label.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let task_label = Arc::clone(&label);
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(context = %task_label, "Callback panicked");
                }
            }
            tracing::trace!(context = %task_label, "Execution context closed");
        });

        Self { label, tx, handle }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue `job` behind everything already dispatched. Returns `false` if the
    /// context's task is gone (runtime shut down).
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }

    /// Queue `job` and wait for its result.
    ///
    /// Returns `None` if the job never ran or panicked.
    pub async fn run<R, F>(&self, job: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let queued = self.dispatch(move || {
            let _ = result_tx.send(job());
        });
        if !queued {
            return None;
        }
        result_rx.await.ok()
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
