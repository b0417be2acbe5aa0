//! Per-request context carrying a cancellation signal.
//!
//! Store I/O wrapped in [`RequestContext::run`] stops waiting as soon as the
//! caller cancels; nothing is compensated beyond dropping the pending future.

use crate::error::{GraphError, Result};
use crate::types::new_id;
use std::future::Future;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct RequestContext {
    cancel: watch::Receiver<bool>,
    trace_id: String,
}

/// Cancels every context cloned from the one it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl RequestContext {
    /// A context that is never cancelled.
    pub fn new() -> Self {
        let (sender, cancel) = watch::channel(false);
        // The value stays `false` once the sender is gone.
        drop(sender);
        RequestContext {
            cancel,
            trace_id: new_id(),
        }
    }

    pub fn cancellable() -> (Self, CancelHandle) {
        let (sender, cancel) = watch::channel(false);
        let ctx = RequestContext {
            cancel,
            trace_id: new_id(),
        };
        (ctx, CancelHandle { sender })
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GraphError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            if cancel.changed().await.is_err() {
                // Sender dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }

    /// Drive `fut` unless the context is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(GraphError::Cancelled),
            out = fut => out,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
