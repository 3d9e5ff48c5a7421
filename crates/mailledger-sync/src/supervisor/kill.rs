//! Idempotent termination requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Requests termination of one worker.
///
/// Cloning yields another handle to the same worker. Only the first call to
/// [`KillSwitch::kill`] has an effect; the worker's owner observes it and
/// signals the process. Killing is advisory: the process is gone only once
/// its terminal event has been delivered.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    notify: Notify,
}

impl KillSwitch {
    /// Creates a switch that has not been triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests termination. Returns `true` only for the first request.
    pub fn kill(&self) -> bool {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.notify.notify_one();
        true
    }

    /// Whether termination has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Completes once termination has been requested.
    pub(crate) async fn requested(&self) {
        if self.is_requested() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_only_first_kill_counts() {
        let switch = KillSwitch::new();
        let other = switch.clone();
        assert!(!switch.is_requested());
        assert!(switch.kill());
        assert!(!other.kill());
        assert!(!switch.kill());
        assert!(other.is_requested());
    }

    #[tokio::test]
    async fn test_requested_wakes_waiter() {
        let switch = KillSwitch::new();
        let waiter = switch.clone();
        let handle = tokio::spawn(async move { waiter.requested().await });

        tokio::task::yield_now().await;
        switch.kill();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_requested_after_kill_returns_immediately() {
        let switch = KillSwitch::new();
        switch.kill();
        tokio::time::timeout(Duration::from_millis(100), switch.requested())
            .await
            .unwrap();
    }
}
