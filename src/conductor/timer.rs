use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Pause between conductor passes that `interrupt` cuts short for good.
#[derive(Debug, Clone)]
pub struct WaitTimer {
    timeout: Duration,
    stop: CancellationToken,
}

impl WaitTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            stop: CancellationToken::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Idempotent; wakes any pending [`wait`](Self::wait).
    pub fn interrupt(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Sleep for the timeout. Returns false if interrupted instead.
    pub async fn wait(&self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.timeout) => true,
        }
    }
}
