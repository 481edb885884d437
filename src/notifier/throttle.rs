//! Admission control: a per-interval dispatch budget plus a FIFO queue of
//! deferred work flushed by a periodic drain tick.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A parked unit of work. Built lazily so every drain attempt gets a fresh
/// future.
pub(crate) type DeferredTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Rate gate: at most `limit` admissions per `interval`, with overflow work
/// parked until a later drain tick.
pub(crate) struct Throttle {
    limit: u32,
    max_size: usize,
    interval: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    request_count: u32,
    queue: VecDeque<DeferredTask>,
}

impl Throttle {
    pub fn new(limit: u32, max_size: usize, interval: Duration) -> Self {
        Self {
            limit,
            max_size,
            interval,
            state: Mutex::new(State::default()),
        }
    }

    /// Pure admission predicate: budget left this interval and the queue not
    /// past its advisory bound. No side effects.
    pub fn can(&self) -> bool {
        let state = self.state.lock();
        state.request_count < self.limit && state.queue.len() < self.max_size
    }

    /// Consume one slot of the per-interval budget.
    pub fn admit(&self) {
        self.state.lock().request_count += 1;
    }

    /// Park a task for a later drain tick. Never blocks or rejects: the
    /// `max_size` bound is advisory and enforced only through `can()`, so
    /// rate-limit retries always find room.
    pub fn enqueue(&self, task: DeferredTask) {
        self.state.lock().queue.push_back(task);
    }

    pub fn dequeue(&self) -> Option<DeferredTask> {
        self.state.lock().queue.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[cfg(test)]
    pub fn request_count(&self) -> u32 {
        self.state.lock().request_count
    }

    fn has_budget(&self) -> bool {
        self.state.lock().request_count < self.limit
    }

    /// One drain tick: reset the budget, then run parked tasks head-to-tail,
    /// one at a time, while budget remains.
    ///
    /// Draining checks only the rate budget, not the queue bound: the bound
    /// exists to defer *new* work, and gating the drain on it would leave an
    /// over-full queue stuck forever. Tasks are infallible `()` futures (each
    /// reports failure through its own pending handle), so a failing task
    /// cannot stop the rest of the batch or kill the timer.
    pub async fn drain(&self) {
        self.state.lock().request_count = 0;

        while self.has_budget() {
            let Some(task) = self.dequeue() else { break };
            self.admit();
            task().await;
        }
    }

    /// Spawn the recurring drain loop. The caller owns the handle and aborts
    /// it on drop.
    pub fn spawn_drain(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let throttle = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(throttle.interval);
            // The first tick of a tokio interval fires immediately; skip it
            // so a full interval elapses before the first drain.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                throttle.drain().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_task(counter: &Arc<AtomicU32>) -> DeferredTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[test]
    fn can_denies_once_budget_is_spent() {
        let throttle = Throttle::new(2, 10, Duration::from_secs(1));
        assert!(throttle.can());
        throttle.admit();
        assert!(throttle.can());
        throttle.admit();
        assert!(!throttle.can());
    }

    #[test]
    fn can_denies_once_queue_reaches_bound() {
        let throttle = Throttle::new(10, 1, Duration::from_secs(1));
        assert!(throttle.can());
        throttle.enqueue(Box::new(|| async {}.boxed()));
        assert!(!throttle.can());
    }

    #[test]
    fn enqueue_never_rejects_past_the_bound() {
        let throttle = Throttle::new(10, 1, Duration::from_secs(1));
        throttle.enqueue(Box::new(|| async {}.boxed()));
        throttle.enqueue(Box::new(|| async {}.boxed()));
        assert_eq!(throttle.queue_len(), 2);
    }

    #[tokio::test]
    async fn drain_admits_at_most_limit_per_tick() {
        let throttle = Throttle::new(2, 10, Duration::from_secs(1));
        let ran = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            throttle.enqueue(counting_task(&ran));
        }

        throttle.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(throttle.queue_len(), 3);

        // The next tick resets the budget and takes the next two.
        throttle.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(throttle.queue_len(), 1);
    }

    #[tokio::test]
    async fn drain_resets_a_spent_budget() {
        let throttle = Throttle::new(1, 10, Duration::from_secs(1));
        throttle.admit();
        assert!(!throttle.can());

        let ran = Arc::new(AtomicU32::new(0));
        throttle.enqueue(counting_task(&ran));
        throttle.drain().await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // Budget was reset, then one admission for the drained task.
        assert_eq!(throttle.request_count(), 1);
    }

    #[tokio::test]
    async fn drain_proceeds_even_when_queue_is_over_its_bound() {
        let throttle = Throttle::new(10, 1, Duration::from_secs(1));
        let ran = Arc::new(AtomicU32::new(0));
        throttle.enqueue(counting_task(&ran));
        throttle.enqueue(counting_task(&ran));
        assert!(!throttle.can());

        throttle.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(throttle.queue_len(), 0);
    }
}
