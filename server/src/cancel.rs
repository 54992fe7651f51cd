//! Cancellation signals for long-running operations.
//!
//! A [`CancelSignal`] is a `watch::Receiver<bool>` that flips to `true` once.
//! Chunking, streaming, the backoff loop and every background task take one
//! and stop before their next unit of work when it fires.

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};

pub type CancelSignal = watch::Receiver<bool>;

/// Owning side of a cancellation signal. Cloning shares the same signal.
#[derive(Debug, Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// A canceller that also fires when `parent` fires.
    pub fn linked(mut parent: CancelSignal) -> (Self, CancelSignal) {
        let (canceller, rx) = Self::new();
        let child = canceller.clone();
        let mut watch_child = rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled(&mut parent) => child.cancel(),
                _ = cancelled(&mut watch_child) => {}
            }
        });
        (canceller, rx)
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        self.tx.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A signal that never fires. Used by callers that have no cancellation scope
/// of their own (HTTP handlers are cancelled by dropping the future instead).
pub fn never() -> CancelSignal {
    let (_tx, rx) = watch::channel(false);
    rx
}

pub fn is_cancelled(signal: &CancelSignal) -> bool {
    *signal.borrow()
}

/// `Err(Cancelled)` once the signal has fired.
pub fn check(signal: &CancelSignal) -> Result<()> {
    if is_cancelled(signal) {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Resolves when the signal fires. Pends forever if the sender is gone
/// without having fired.
pub async fn cancelled(signal: &mut CancelSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_fires_signal() {
        let (canceller, mut signal) = Canceller::new();
        assert!(check(&signal).is_ok());

        canceller.cancel();
        assert!(matches!(check(&signal), Err(Error::Cancelled)));
        tokio::time::timeout(Duration::from_secs(1), cancelled(&mut signal))
            .await
            .expect("signal should resolve after cancel");
    }

    #[tokio::test]
    async fn test_never_does_not_resolve() {
        let mut signal = never();
        let result = tokio::time::timeout(Duration::from_millis(50), cancelled(&mut signal)).await;
        assert!(result.is_err());
        assert!(!is_cancelled(&signal));
    }

    #[tokio::test]
    async fn test_linked_follows_parent() {
        let (parent, parent_signal) = Canceller::new();
        let (_child, mut child_signal) = Canceller::linked(parent_signal);

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), cancelled(&mut child_signal))
            .await
            .expect("child should fire when parent fires");
    }
}
