//! Cooperative stop signalling shared by the long-running loops.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A latch that loops check every iteration and sleep-wait on.
#[derive(Debug, Default)]
pub struct StopToken {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub async fn wait(&self) {
        while !self.stop_requested() {
            let notified = self.notify.notified();
            if self.stop_requested() {
                break;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_request() {
        let token = std::sync::Arc::new(StopToken::new());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.wait().await })
        };
        token.request_stop();
        waiter.await.unwrap();
        assert!(token.stop_requested());
    }
}
