//! Per-call delivery confirmation.
//!
//! Every tracked publish gets its own correlation token and one-shot channel.
//! The connection worker resolves tokens as broker acknowledgments arrive;
//! a waiter only ever observes the outcome of its own token. Dropping an
//! [`AckWait`] removes its entry, so a timed-out call leaves nothing behind
//! for a late acknowledgment to fire into.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Identifies one tracked publish for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationToken(pub(crate) u64);

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct AckRegistry {
    next: AtomicU64,
    pending: Mutex<HashMap<CorrelationToken, oneshot::Sender<bool>>>,
}

impl AckRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a fresh token and the waiter bound to it.
    pub fn register(self: &Arc<Self>) -> AckWait {
        let token = CorrelationToken(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(token, tx);
        AckWait {
            token,
            rx: Some(rx),
            registry: Arc::clone(self),
        }
    }

    /// Report the outcome for `token`. Returns `false` when nobody is waiting
    /// any more (timed out or never registered).
    pub fn resolve(&self, token: CorrelationToken, delivered: bool) -> bool {
        match self.pending.lock().remove(&token) {
            Some(tx) => tx.send(delivered).is_ok(),
            None => false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn forget(&self, token: CorrelationToken) {
        self.pending.lock().remove(&token);
    }
}

/// How a tracked publish ended, from the waiter's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The broker acknowledged this publish.
    Delivered,
    /// The worker gave up on it (session lost, submit refused).
    Rejected,
    /// Nothing arrived within the wait bound.
    TimedOut,
}

impl AckOutcome {
    pub fn is_delivered(self) -> bool {
        self == AckOutcome::Delivered
    }
}

/// Waiting side of one tracked publish.
#[derive(Debug)]
pub struct AckWait {
    token: CorrelationToken,
    rx: Option<oneshot::Receiver<bool>>,
    registry: Arc<AckRegistry>,
}

impl AckWait {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    /// Outcome for this token, bounded by `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> AckOutcome {
        let Some(rx) = self.rx.take() else {
            return AckOutcome::Rejected;
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => AckOutcome::Delivered,
            // A dropped sender means the registry forgot the token.
            Ok(Ok(false)) | Ok(Err(_)) => AckOutcome::Rejected,
            Err(_) => AckOutcome::TimedOut,
        }
    }
}

impl Drop for AckWait {
    fn drop(&mut self) {
        self.registry.forget(self.token);
    }
}
