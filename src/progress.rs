//! One-way status channel. Orchestrators publish, a display task subscribes.
//! Nothing in the fetch path reads it back.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<Arc<watch::Sender<String>>>,
}

impl Progress {
    /// Publishing is a no-op.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel(initial: impl Into<String>) -> (Self, watch::Receiver<String>) {
        let (tx, rx) = watch::channel(initial.into());
        (Self { tx: Some(Arc::new(tx)) }, rx)
    }

    /// Replace the current message. Never blocks and never fails, even with no subscriber.
    pub fn publish(&self, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            tx.send_replace(message.into());
        }
    }
}

/// Default consumer: log every change until all publishers are dropped.
pub fn spawn_log_display(mut rx: watch::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let message = rx.borrow_and_update().clone();
            info!(target: "progress", "{message}");
        }
    })
}
