//! Two-phase shutdown gate

use tokio::sync::watch;
use tracing::debug;

/// One-shot signal that stays fired
struct Signal {
    fired: watch::Sender<bool>,
}

impl Signal {
    fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self { fired }
    }

    /// Returns true only for the call that actually fired the signal
    fn fire(&self) -> bool {
        self.fired.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    fn is_fired(&self) -> bool {
        *self.fired.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.fired.subscribe();
        // The sender lives as long as `self`, so this only returns once fired
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// `start` marks the beginning of a graceful stop (stop accepting new work),
/// `done` marks the end of teardown. Both fire at most once; waiters that
/// arrive after a signal fired return immediately.
pub struct ShutdownGate {
    start: Signal,
    done: Signal,
}

impl ShutdownGate {
    pub fn new() -> Self {
        Self {
            start: Signal::new(),
            done: Signal::new(),
        }
    }

    pub fn start(&self) {
        if self.start.fire() {
            debug!("Shutdown started");
        }
    }

    pub fn done(&self) {
        if self.done.fire() {
            debug!("Shutdown done");
        }
    }

    pub fn is_started(&self) -> bool {
        self.start.is_fired()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_fired()
    }

    pub async fn wait_start(&self) {
        self.start.wait().await
    }

    pub async fn wait_done(&self) {
        self.done.wait().await
    }
}

impl Default for ShutdownGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_wait_after_fire_returns_immediately() {
        let gate = ShutdownGate::new();
        gate.start();

        timeout(Duration::from_millis(100), gate.wait_start())
            .await
            .unwrap();
        assert!(gate.is_started());
        assert!(!gate.is_done());
    }

    #[tokio::test]
    async fn test_start_twice_is_same_as_once() {
        let gate = ShutdownGate::new();
        gate.start();
        gate.start();

        assert!(gate.is_started());
        timeout(Duration::from_millis(100), gate.wait_start())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiters_released_on_fire() {
        let gate = Arc::new(ShutdownGate::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait_done().await })
            })
            .collect();

        tokio::task::yield_now().await;
        gate.done();

        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_phases_are_independent() {
        let gate = ShutdownGate::new();
        gate.start();

        let blocked = timeout(Duration::from_millis(50), gate.wait_done()).await;
        assert!(blocked.is_err());

        gate.done();
        timeout(Duration::from_millis(100), gate.wait_done())
            .await
            .unwrap();
    }
}
