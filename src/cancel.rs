//! Chained cancellation tokens.
//!
//! Cancellation flows one way: server root token → session token →
//! per-call token. Cancelling a token cancels everything below it, never
//! above it. A dropped ancestor (e.g. a dropped server) counts as
//! cancelled, so sessions never outlive their owner silently.

use std::sync::Arc;

use futures_util::future::{select_all, FutureExt};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub(crate) struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    ancestors: Vec<watch::Receiver<bool>>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            ancestors: Vec::new(),
        }
    }

    /// A child token: cancelled when it, or any ancestor, is cancelled.
    pub(crate) fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.tx.subscribe());
        Self {
            tx: Arc::new(tx),
            ancestors,
        }
    }

    pub(crate) fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.tx.borrow() || self.ancestors.iter().any(ancestor_cancelled)
    }

    /// Resolves once this token or any ancestor is cancelled.
    pub(crate) async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rxs: Vec<watch::Receiver<bool>> = self.ancestors.clone();
        rxs.push(self.tx.subscribe());
        let waits = rxs.iter_mut().map(|rx| wait_one(rx).boxed()).collect::<Vec<_>>();
        select_all(waits).await;
    }
}

fn ancestor_cancelled(rx: &watch::Receiver<bool>) -> bool {
    // A dropped sender means the owner of that level is gone.
    *rx.borrow() || rx.has_changed().is_err()
}

async fn wait_one(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_reaches_children_but_not_siblings() {
        let root = CancelToken::new();
        let session = root.child();
        let call_a = session.child();
        let call_b = session.child();

        call_a.cancel();
        assert!(call_a.is_cancelled());
        assert!(!call_b.is_cancelled());
        assert!(!session.is_cancelled());

        session.cancel();
        assert!(call_b.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_a_waiting_grandchild() {
        let root = CancelToken::new();
        let session = root.child();
        let call = session.child();

        let waiter = tokio::spawn(async move { call.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        root.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("grandchild did not observe root cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_ancestor_counts_as_cancelled() {
        let root = CancelToken::new();
        let call = root.child();
        drop(root);
        assert!(call.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), call.cancelled())
            .await
            .expect("dropped root should resolve cancellation");
    }
}
