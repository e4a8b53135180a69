//! One-shot shareable completions
//!
//! A [`PendingFuture`] settles exactly once: resolved with a value, rejected
//! with a server error, or cancelled locally. Clones share the same outcome,
//! so several callers can wait on one subscribe acknowledgement.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::BayeuxError;

#[derive(Debug, Clone)]
enum Outcome<T> {
    Pending,
    Resolved(T),
    Rejected(String),
    Cancelled(String),
}

/// A shareable, cancellable completion
#[derive(Debug, Clone)]
pub struct PendingFuture<T: Clone> {
    state: Arc<watch::Sender<Outcome<T>>>,
}

impl<T: Clone> Default for PendingFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> PendingFuture<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Outcome::Pending);
        Self {
            state: Arc::new(tx),
        }
    }

    /// A future that is already resolved
    pub fn resolved(value: T) -> Self {
        let future = Self::new();
        future.resolve(value);
        future
    }

    fn settle(&self, outcome: Outcome<T>) -> bool {
        let mut outcome = Some(outcome);
        self.state.send_if_modified(|current| {
            if matches!(current, Outcome::Pending) {
                if let Some(next) = outcome.take() {
                    *current = next;
                    return true;
                }
            }
            false
        })
    }

    /// Resolve with a value; returns `false` if already settled
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Outcome::Resolved(value))
    }

    /// Reject with a server-provided reason
    pub fn reject(&self, reason: impl Into<String>) -> bool {
        self.settle(Outcome::Rejected(reason.into()))
    }

    /// Cancel locally, typically on disconnect
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.settle(Outcome::Cancelled(reason.into()))
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), Outcome::Pending)
    }

    /// Whether two handles share the same completion
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Wait until the future settles
    pub async fn wait(&self) -> Result<T, BayeuxError> {
        let mut rx = self.state.subscribe();
        let outcome = match rx.wait_for(|o| !matches!(o, Outcome::Pending)).await {
            Ok(outcome) => outcome.clone(),
            // The sender lives as long as `self`, so this is unreachable in practice
            Err(_) => return Err(BayeuxError::Cancelled("dropped".to_string())),
        };
        match outcome {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(reason) => Err(BayeuxError::Rejected(reason)),
            Outcome::Cancelled(reason) => Err(BayeuxError::Cancelled(reason)),
            Outcome::Pending => Err(BayeuxError::Cancelled("pending".to_string())),
        }
    }
}
