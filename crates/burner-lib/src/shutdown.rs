//! Cooperative cancellation shared by long-running stages

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cloneable shutdown signal
///
/// Every clone observes the same flag. Triggering it never interrupts an
/// in-flight call; stages check it before starting new work.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Trigger shutdown for every clone
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Trigger automatically after `timeout`
    ///
    /// Returns the handle of the timer task so callers can abort it once the
    /// guarded work finishes.
    pub fn trigger_after(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!(timeout_secs = timeout.as_secs(), "Deadline reached, initiating shutdown");
            signal.trigger();
        })
    }

    /// Child signal that follows this one but can also be triggered on its own
    pub fn child(&self) -> (Shutdown, tokio::task::JoinHandle<()>) {
        let child = Shutdown::new();
        if self.is_triggered() {
            child.trigger();
        }
        let parent = self.clone();
        let forward = child.clone();
        let handle = tokio::spawn(async move {
            parent.triggered().await;
            forward.trigger();
        });
        (child, handle)
    }

    /// Child signal that fires when either this one fires or `deadline` passes
    pub fn child_with_deadline(&self, deadline: Instant) -> (Shutdown, tokio::task::JoinHandle<()>) {
        let child = Shutdown::new();
        if self.is_triggered() {
            child.trigger();
        }
        let parent = self.clone();
        let forward = child.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = parent.triggered() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
            forward.trigger();
        });
        (child, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_visible_to_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_triggered());
        shutdown.trigger();
        assert!(clone.is_triggered());
        clone.triggered().await;
    }

    #[tokio::test]
    async fn test_trigger_after_timeout() {
        let shutdown = Shutdown::new();
        let _handle = shutdown.trigger_after(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(2), shutdown.triggered())
            .await
            .expect("shutdown should fire");
    }

    #[tokio::test]
    async fn test_child_follows_parent_but_not_back() {
        let parent = Shutdown::new();
        let (child, _h) = parent.child();
        child.trigger();
        assert!(!parent.is_triggered());

        let (other, _h2) = parent.child();
        parent.trigger();
        tokio::time::timeout(Duration::from_secs(2), other.triggered())
            .await
            .expect("child should follow parent");
    }

    #[tokio::test]
    async fn test_child_fires_on_deadline_only() {
        let parent = Shutdown::new();
        let (child, _h) = parent.child_with_deadline(Instant::now() + Duration::from_millis(20));
        child.triggered().await;
        assert!(child.is_triggered());
        assert!(!parent.is_triggered());
    }
}
