use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
/// A token which can be used to abandon a retrying operation.
///
/// The token is checked before every attempt and while waiting out a backoff
/// delay, an attempt which has already started always runs to completion.
/// Clones share the same state, cancelling one cancels them all.
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Cancels the token, waking any tasks waiting on [CancelToken::cancelled].
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }

            // The sender lives as long as any clone of the token does.
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}
