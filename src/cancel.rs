//! Cooperative cancellation
//!
//! A `CancelToken` wraps a `watch` channel carrying a single "cancelled"
//! flag. Clones share the flag; long-running operations poll it between
//! steps and race it against remote calls.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Signal every clone of this token
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Return `Err(Cancelled)` once the token has fired
    pub fn check(&self) -> VaultResult<()> {
        if self.is_cancelled() {
            Err(VaultError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when the token fires
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                // Sender is owned by the token itself, so this only happens
                // during teardown; never resolve in that case.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
