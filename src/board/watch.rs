use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordination::{CoordinationError, Coordinator, WatchEvent};

const RETRY_BASE_MS: u64 = 50;
const RETRY_MAX_MS: u64 = 2_000;

/// Receives the children listings of a watched path.
#[async_trait]
pub trait ChildrenHandler: Send + Sync + 'static {
    async fn on_children(&self, path: &str, children: &[String]);

    /// The watched node no longer exists.
    async fn on_gone(&self, path: &str);
}

/// Cancellation scope of a board's watches. Closing it stops every watch
/// spawned under it; the next [`open`](Self::open) starts a fresh scope.
#[derive(Debug, Default)]
pub struct WatchScope {
    token: Mutex<CancellationToken>,
}

impl WatchScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> MutexGuard<'_, CancellationToken> {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Token for a watch started by `connect`, reopening a closed scope.
    pub fn open(&self) -> CancellationToken {
        let mut token = self.current();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.child_token()
    }

    /// Token for a watch started under the current scope. Already cancelled
    /// if the scope is closed.
    pub fn token(&self) -> CancellationToken {
        self.current().child_token()
    }

    pub fn close(&self) {
        self.current().cancel();
    }
}

/// Exponential backoff with jitter for re-attaching a failed watch.
pub fn retry_delay(attempt: u32) -> Duration {
    let backoff = RETRY_BASE_MS
        .saturating_mul(1u64 << attempt.min(10))
        .min(RETRY_MAX_MS);
    let jitter = rand::thread_rng().gen_range(0..=RETRY_BASE_MS);
    Duration::from_millis(backoff + jitter)
}

/// Keep a children watch on `path` attached until `cancel` fires or the node
/// is deleted. Attachment failures are retried; a watch stream that ends is
/// re-attached, which is how a deleted node is noticed.
pub fn spawn_watch<H: ChildrenHandler>(
    coordinator: Arc<dyn Coordinator>,
    handler: Arc<H>,
    path: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt = 0u32;
        loop {
            let attached = tokio::select! {
                _ = cancel.cancelled() => return,
                attached = coordinator.watch_children(&path) => attached,
            };

            let mut watch = match attached {
                Ok(watch) => {
                    attempt = 0;
                    watch
                }
                Err(CoordinationError::NoNode(_)) => {
                    tracing::debug!(path = %path, "Watched node is gone");
                    handler.on_gone(&path).await;
                    return;
                }
                Err(e) => {
                    let delay = retry_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        path = %path,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to attach children watch"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = watch.recv() => event,
                };
                match event {
                    Some(WatchEvent::Children(children)) => {
                        handler.on_children(&path, &children).await;
                    }
                    Some(WatchEvent::SessionLost) => {
                        tracing::warn!(path = %path, "Coordination session lost, watch suspended");
                    }
                    Some(WatchEvent::SessionRestored) => {
                        tracing::info!(path = %path, "Coordination session restored");
                    }
                    None => break,
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_bounded() {
        for attempt in 0..40 {
            let delay = retry_delay(attempt);
            assert!(delay >= Duration::from_millis(RETRY_BASE_MS));
            assert!(delay <= Duration::from_millis(RETRY_MAX_MS + RETRY_BASE_MS));
        }
    }

    #[test]
    fn closed_scope_reopens() {
        let scope = WatchScope::new();
        let first = scope.open();
        scope.close();
        assert!(first.is_cancelled());
        assert!(scope.token().is_cancelled());

        let second = scope.open();
        assert!(!second.is_cancelled());
        assert!(!scope.token().is_cancelled());
    }
}
