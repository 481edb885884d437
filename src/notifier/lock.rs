//! FIFO critical section for dispatch operations.

use std::future::Future;
use tokio::sync::Mutex;

/// Serializes dispatch operations into a strict total order.
///
/// `tokio::sync::Mutex` queues waiters fairly, so operations complete their
/// critical sections in submission order regardless of how long each takes.
/// The guard drops on every exit path, including errors and panics inside
/// `op`. Not reentrant: code running under the lock must not call [`run`]
/// again, or it deadlocks waiting on itself.
///
/// [`run`]: DispatchLock::run
#[derive(Debug, Default)]
pub(crate) struct DispatchLock {
    inner: Mutex<()>,
}

impl DispatchLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` to completion while holding the lock, behind every operation
    /// submitted earlier. Returns whatever `op` returns.
    pub async fn run<T, F>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.inner.lock().await;
        op.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn operations_complete_in_submission_order() {
        let lock = Arc::new(DispatchLock::new());
        let order = Arc::new(SyncMutex::new(Vec::new()));

        // A is slow, B is instant, C is in between. Submission order must
        // still win.
        let mut handles = Vec::new();
        for (name, work_ms) in [("a", 50_u64), ("b", 0), ("c", 10)] {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                lock.run(async {
                    tokio::time::sleep(Duration::from_millis(work_ms)).await;
                    order.lock().push(name);
                })
                .await;
            }));
            // Yield so each task reaches the lock queue before the next
            // spawn, pinning the submission order.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn lock_releases_after_a_failed_operation() {
        let lock = DispatchLock::new();

        let failed: Result<(), &str> = lock.run(async { Err("boom") }).await;
        assert!(failed.is_err());

        // A failure must not wedge the gate for the next waiter.
        let ok = lock.run(async { 42 }).await;
        assert_eq!(ok, 42);
    }
}
