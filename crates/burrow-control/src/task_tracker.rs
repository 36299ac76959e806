//! Task tracking for relay sessions
//!
//! Keeps the JoinHandle of every running relay keyed by session id, so a
//! control channel can abort its relays when it goes away and a supervisor
//! can wait for in-flight relays to drain.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Tracks relay tasks by session id
pub struct TaskTracker {
    /// session_id -> (generation, handle)
    tasks: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    generation: AtomicU64,
    idle: Notify,
}

impl TaskTracker {
    /// Create a new task tracker
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    /// Spawn `task` for a session. The entry removes itself when the task
    /// completes; an existing task for the same session is aborted first.
    pub fn spawn<F>(self: &Arc<Self>, session_id: String, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let tracker = Arc::clone(self);
        let id = session_id.clone();

        // Held across the spawn so the task cannot finish (and deregister)
        // before it is registered
        if let Ok(mut tasks) = self.tasks.lock() {
            let handle = tokio::spawn(async move {
                let _entry = Deregister {
                    tracker,
                    session_id: id,
                    generation,
                };
                task.await;
            });
            if let Some((_, old_handle)) = tasks.insert(session_id, (generation, handle)) {
                old_handle.abort();
            }
        }
    }

    /// Unregister and abort the task for a session
    pub fn unregister(&self, session_id: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some((_, handle)) = tasks.remove(session_id) {
                handle.abort();
            }
            if tasks.is_empty() {
                self.idle.notify_waiters();
            }
        }
    }

    /// Abort every tracked task
    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, (_, handle)) in tasks.drain() {
                handle.abort();
            }
            self.idle.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no task is tracked
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self, session_id: &str, generation: u64) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if tasks.get(session_id).map(|(g, _)| *g) == Some(generation) {
                tasks.remove(session_id);
            }
            if tasks.is_empty() {
                self.idle.notify_waiters();
            }
        }
    }
}

/// Removes a task's entry however the task ends: completion, abort or panic
struct Deregister {
    tracker: Arc<TaskTracker>,
    session_id: String,
    generation: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.tracker.finish(&self.session_id, self.generation);
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_spawn_and_unregister() {
        let tracker = Arc::new(TaskTracker::new());

        tracker.spawn("session-1".to_string(), async {
            tokio::time::sleep(Duration::from_secs(10)).await
        });
        assert_eq!(tracker.len(), 1);

        tracker.unregister("session-1");
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_replacing_task() {
        let tracker = Arc::new(TaskTracker::new());

        tracker.spawn("session-1".to_string(), async {
            tokio::time::sleep(Duration::from_secs(10)).await
        });
        // Second task for the same session replaces (and aborts) the first
        tracker.spawn("session-1".to_string(), async {
            tokio::time::sleep(Duration::from_secs(10)).await
        });

        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_finished_task_removes_itself() {
        let tracker = Arc::new(TaskTracker::new());
        let (tx, rx) = oneshot::channel::<()>();

        tracker.spawn("session-1".to_string(), async move {
            let _ = rx.await;
        });
        assert_eq!(tracker.len(), 1);

        tx.send(()).unwrap();
        timeout(Duration::from_secs(1), tracker.wait_idle())
            .await
            .unwrap();
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_abort_all_releases_waiters() {
        let tracker = Arc::new(TaskTracker::new());
        for i in 0..3 {
            tracker.spawn(format!("session-{}", i), async {
                tokio::time::sleep(Duration::from_secs(10)).await
            });
        }

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_idle().await }
        });
        tokio::task::yield_now().await;

        tracker.abort_all();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_panicked_task_removes_itself() {
        let tracker = Arc::new(TaskTracker::new());

        tracker.spawn("session-1".to_string(), async {
            panic!("relay blew up");
        });

        timeout(Duration::from_secs(1), tracker.wait_idle())
            .await
            .unwrap();
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_wait_idle_when_empty() {
        let tracker = TaskTracker::new();
        timeout(Duration::from_millis(100), tracker.wait_idle())
            .await
            .unwrap();
    }
}
