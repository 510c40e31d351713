use std::sync::Arc;

use futures_util::future::select_all;
use tokio::sync::watch;

/// Cancellation scope and correlation data handed to publish and handle calls.
///
/// A context is cancelled as soon as any of the signals it inherited fires.
/// Cloning is cheap: clones share the same signals.
#[derive(Debug, Clone, Default)]
pub struct Context {
    signals: Vec<watch::Receiver<bool>>,
    request_id: Option<String>,
}

/// Cancels the context returned alongside it by [`Context::with_cancel`],
/// and every context later derived from that one.
///
/// Dropping the handle does not cancel anything.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Raise the cancellation signal. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Context {
    /// A context that is never cancelled
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child context that is cancelled when either this context or
    /// the returned handle is cancelled.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        let mut child = self.clone();
        child.signals.push(receiver);
        (
            child,
            CancelHandle {
                sender: Arc::new(sender),
            },
        )
    }

    /// Same cancellation scope, carrying a correlation id
    pub fn with_request_id(&self, request_id: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.request_id = Some(request_id.into());
        child
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.iter().any(|signal| *signal.borrow())
    }

    /// Resolves once the context is cancelled; pending forever for a
    /// background context.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        if self.signals.is_empty() {
            return std::future::pending().await;
        }

        let waits = self.signals.iter().cloned().map(|mut signal| {
            Box::pin(async move {
                let source_gone = signal.wait_for(|cancelled| *cancelled).await.is_err();
                if source_gone {
                    // handle dropped without cancelling: this branch never fires
                    std::future::pending::<()>().await;
                }
            })
        });

        select_all(waits).await;
    }
}
