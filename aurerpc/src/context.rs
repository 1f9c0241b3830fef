use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Caller-side cancellation scope for a call.
///
/// A context only cancels the wait on the caller's side: the pending entry is
/// removed so a late response is discarded, there is no protocol-level cancel
/// message. The default context has no deadline and never fires.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Derives a context cancelled when either this one or the parent is.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the context fires, yielding the reason.
    pub(crate) async fn done(&self) -> &'static str {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = tokio::time::sleep_until(deadline) => "context deadline exceeded",
                () = self.cancel.cancelled() => "context canceled",
            },
            None => {
                self.cancel.cancelled().await;
                "context canceled"
            }
        }
    }
}
