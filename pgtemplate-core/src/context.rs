//! Caller-supplied deadline and cancellation.
//!
//! Waiting for the clone gate is the one place a caller can be stuck behind
//! other tests. A [`Context`] lets the caller bound that wait and get a
//! distinct [`Error::ContextEnded`](crate::Error::ContextEnded) back instead
//! of hanging.

use std::future::pending;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Ends the [`Context`] it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that never ends.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// A context ended explicitly through the returned handle.
    ///
    /// Dropping the handle without calling `cancel` leaves the context running.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: None,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// Derive a context that also ends after `timeout`, keeping any earlier
    /// deadline and the cancel signal.
    pub fn timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        let cancelled = self.cancel.as_ref().is_some_and(|rx| *rx.borrow());
        expired || cancelled
    }

    /// Resolves once the deadline passes or the context is cancelled.
    pub async fn done(&self) {
        let expired = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        let cancelled = async {
            match &self.cancel {
                Some(rx) => {
                    let mut rx = rx.clone();
                    let handle_dropped = rx.wait_for(|cancelled| *cancelled).await.is_err();
                    // A dropped handle can never cancel.
                    if handle_dropped {
                        pending::<()>().await;
                    }
                }
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = expired => {}
            _ = cancelled => {}
        }
    }
}
