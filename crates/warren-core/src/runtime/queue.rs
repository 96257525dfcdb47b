//! De-duplicating work queue with delayed and rate-limited adds.
//!
//! A key is queued at most once. A key added while a worker holds it is
//! marked dirty and queued again when the worker calls [`WorkQueue::done`],
//! so no key is ever processed by two workers at once.
//!
//! Delayed adds keep at most one timer task per key. A later deadline for a
//! key that already has one is dropped; an earlier one moves the existing
//! timer forward.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

struct Timer {
    deadline: Instant,
    /// Wakes the timer task when the deadline moves forward.
    reschedule: Arc<Notify>,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed, queued or not.
    dirty: HashSet<K>,
    /// Keys currently held by a worker.
    processing: HashSet<K>,
    /// Consecutive failures per key.
    failures: HashMap<K, u32>,
    /// Pending delayed adds, one per key.
    timers: HashMap<K, Timer>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                timers: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff_base,
            backoff_max,
        }
    }

    pub async fn add(&self, key: K) {
        let mut state = self.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub async fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key).await;
            return;
        }
        let deadline = Instant::now() + delay;

        let mut state = self.state.lock().await;
        if state.shutting_down {
            return;
        }
        if let Some(timer) = state.timers.get_mut(&key) {
            if deadline < timer.deadline {
                timer.deadline = deadline;
                timer.reschedule.notify_one();
            }
            return;
        }

        let reschedule = Arc::new(Notify::new());
        state.timers.insert(
            key.clone(),
            Timer {
                deadline,
                reschedule: Arc::clone(&reschedule),
            },
        );
        drop(state);

        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run_timer(key, deadline, reschedule).await });
    }

    async fn run_timer(&self, key: K, mut deadline: Instant, reschedule: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = reschedule.notified() => {}
            }

            let mut state = self.state.lock().await;
            let Some(current) = state.timers.get(&key).map(|t| t.deadline) else {
                return;
            };
            if current > Instant::now() {
                deadline = current;
                continue;
            }
            state.timers.remove(&key);
            drop(state);
            self.add(key).await;
            return;
        }
    }

    /// Add `key` after its per-key exponential backoff delay.
    pub async fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = {
            let mut state = self.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            backoff_delay(*failures, self.backoff_base, self.backoff_max)
        };
        self.add_after(key, delay).await;
        delay
    }

    /// Reset the backoff of `key`.
    pub async fn forget(&self, key: &K) {
        self.state.lock().await.failures.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Register before checking so a shutdown in between is not missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing; re-queues it if it was added meanwhile.
    pub async fn done(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of keys waiting on a delayed add.
    pub async fn pending_timers(&self) -> usize {
        self.state.lock().await.timers.len()
    }

    /// Stop accepting keys and wake every waiting worker.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        for (_, timer) in state.timers.drain() {
            timer.reschedule.notify_one();
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

/// `base * 2^(failures - 1)`, capped at `max`.
pub fn backoff_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<&'static str>> {
        Arc::new(WorkQueue::new(
            Duration::from_millis(5),
            Duration::from_secs(300),
        ))
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let q = queue();
        q.add("a").await;
        q.add("a").await;
        q.add("b").await;
        assert_eq!(q.len().await, 2);

        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_after_done() {
        let q = queue();
        q.add("a").await;
        let key = q.get().await.unwrap();

        q.add("a").await;
        // Held by a worker, so not handed out again yet.
        assert!(q.is_empty().await);

        q.done(&key).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let q = queue();
        q.add("a").await;
        let key = q.get().await.unwrap();
        q.done(&key).await;
        assert!(q.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays() {
        let q = queue();
        q.add_after("a", Duration::from_secs(10)).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(q.is_empty().await);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.pending_timers().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_add_after_keeps_one_timer() {
        let q = queue();
        for _ in 0..200 {
            q.add_after("a", Duration::from_secs(86_400)).await;
        }
        q.add_after("b", Duration::from_secs(60)).await;
        assert_eq!(q.pending_timers().await, 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty().await);
        assert_eq!(q.pending_timers().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_moves_timer_forward() {
        let q = queue();
        q.add_after("a", Duration::from_secs(100)).await;
        q.add_after("a", Duration::from_secs(10)).await;
        // A later deadline does not push it back.
        q.add_after("a", Duration::from_secs(50)).await;
        assert_eq!(q.pending_timers().await, 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.pending_timers().await, 0);

        // Fired once; the abandoned 100 s deadline adds nothing more.
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a").await;
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(q.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_grows_and_resets() {
        let q = queue();
        assert_eq!(q.add_rate_limited("a").await, Duration::from_millis(5));
        assert_eq!(q.add_rate_limited("a").await, Duration::from_millis(10));
        assert_eq!(q.add_rate_limited("a").await, Duration::from_millis(20));

        q.forget(&"a").await;
        assert_eq!(q.add_rate_limited("a").await, Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_caps() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(1, base, max), base);
        assert_eq!(backoff_delay(4, base, max), Duration::from_millis(40));
        assert_eq!(backoff_delay(20, base, max), max);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shutdown().await;
        assert_eq!(waiter.await.unwrap(), None);

        q.add("late").await;
        assert!(q.is_empty().await);
    }
}
