//! A key work queue with the usual controller contract.
//!
//! * A key is queued at most once; adding a queued key is a no-op.
//! * A key is handed to at most one worker at a time. Adding a key while it is
//!   being processed only marks it dirty, and it is queued again on [`done`].
//! * Delayed keys become ready at their deadline; re-adding a delayed key keeps
//!   the earliest deadline.
//!
//! Delayed keys are promoted lazily by whichever worker is waiting in
//! [`get`], so the queue needs no background task.
//!
//! [`done`]: RateLimitingQueue::done
//! [`get`]: RateLimitingQueue::get
use super::rate_limit::{default_controller_rate_limiter, RateLimiter};
use opentelemetry::otel_debug;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

// deadline for delays past what `Instant` can represent, about 30 years
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    // deadline per delayed key; the heap may hold stale entries
    waiting: HashMap<K, Instant>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    deadline_keys: HashMap<u64, K>,
    next_seq: u64,
    shutting_down: bool,
    draining: bool,
}

impl<K: Eq + Hash + Clone> State<K> {
    fn new() -> Self {
        State {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: HashMap::new(),
            deadlines: BinaryHeap::new(),
            deadline_keys: HashMap::new(),
            next_seq: 0,
            shutting_down: false,
            draining: false,
        }
    }

    /// Returns whether a waiting worker should be woken.
    fn add(&mut self, key: K) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.waiting.remove(&key);
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Returns whether a waiting worker has to recompute its deadline.
    fn add_after(&mut self, key: K, ready_at: Instant) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        match self.waiting.get(&key) {
            Some(existing) if *existing <= ready_at => return false,
            _ => {}
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting.insert(key.clone(), ready_at);
        self.deadlines.push(Reverse((ready_at, seq)));
        self.deadline_keys.insert(seq, key);
        true
    }

    // move every key whose deadline has passed onto the queue
    fn promote(&mut self, now: Instant) {
        while let Some(Reverse((ready_at, seq))) = self.deadlines.peek().copied() {
            if ready_at > now {
                break;
            }
            self.deadlines.pop();
            let Some(key) = self.deadline_keys.remove(&seq) else {
                continue;
            };
            // a later add or an earlier deadline superseded this entry
            if self.waiting.get(&key) != Some(&ready_at) {
                continue;
            }
            self.waiting.remove(&key);
            self.add(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse((ready_at, _))| *ready_at)
    }

    fn pop(&mut self) -> Option<K> {
        let key = self.queue.pop_front()?;
        self.dirty.remove(&key);
        self.processing.insert(key.clone());
        Some(key)
    }

    fn clear_waiting(&mut self) {
        self.waiting.clear();
        self.deadlines.clear();
        self.deadline_keys.clear();
    }
}

/// Delaying, rate limited work queue keyed by `K`.
pub struct RateLimitingQueue<K> {
    state: Mutex<State<K>>,
    work: Notify,
    drained: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

impl<K> fmt::Debug for RateLimitingQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitingQueue")
            .field("rate_limiter", &self.rate_limiter)
            .finish_non_exhaustive()
    }
}

impl<K> Default for RateLimitingQueue<K>
where
    K: Eq + Hash + Clone + Send + fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new(Box::new(default_controller_rate_limiter()))
    }
}

impl<K> RateLimitingQueue<K>
where
    K: Eq + Hash + Clone,
{
    /// Create a queue whose [`add_rate_limited`](Self::add_rate_limited)
    /// delays come from `rate_limiter`.
    pub fn new(rate_limiter: Box<dyn RateLimiter<K>>) -> Self {
        RateLimitingQueue {
            state: Mutex::new(State::new()),
            work: Notify::new(),
            drained: Notify::new(),
            rate_limiter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` for immediate delivery.
    pub fn add(&self, key: K) {
        if self.lock().add(key) {
            self.work.notify_one();
        }
    }

    /// Queue `key` once `delay` has elapsed. A zero delay is [`add`](Self::add).
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let now = Instant::now();
        let ready_at = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        if self.lock().add_after(key, ready_at) {
            // waiting workers may be sleeping until a later deadline
            self.work.notify_waiters();
        }
    }

    /// Queue `key` after the delay the rate limiter assigns to it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.rate_limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Reset the rate limiter's history for `key`.
    pub fn forget(&self, key: &K) {
        self.rate_limiter.forget(key);
    }

    /// Rate limited retries of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> usize {
        self.rate_limiter.num_requeues(key)
    }

    /// Wait for the next ready key.
    ///
    /// Returns `None` once the queue is shut down. After
    /// [`shut_down_with_drain`](Self::shut_down_with_drain) the keys already
    /// queued are still handed out first.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.work.notified();
            tokio::pin!(notified);
            // register before inspecting the state so no wakeup is lost
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if state.shutting_down && !state.draining {
                    return None;
                }
                state.promote(Instant::now());
                if let Some(key) = state.pop() {
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `key` as processed. If it was added again while processing, it
    /// is queued again.
    pub fn done(&self, key: &K) {
        let (requeued, drained) = {
            let mut state = self.lock();
            let requeued = state.processing.remove(key) && state.dirty.contains(key);
            if requeued {
                state.queue.push_back(key.clone());
            }
            (requeued, state.processing.is_empty())
        };
        if requeued {
            self.work.notify_one();
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Stop handing out keys. Waiting workers receive `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.draining = false;
            state.clear_waiting();
        }
        otel_debug!(name: "RateLimitingQueue.ShutDown");
        self.work.notify_waiters();
    }

    /// Stop accepting keys, hand out the keys already queued, and wait until
    /// every key handed out has been marked [`done`](Self::done).
    pub async fn shut_down_with_drain(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.draining = true;
            state.clear_waiting();
        }
        self.work.notify_waiters();

        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let state = self.lock();
                if state.processing.is_empty() && state.queue.is_empty() {
                    break;
                }
            }
            drained.await;
        }
        otel_debug!(name: "RateLimitingQueue.Drained");
        // late workers now see an empty queue
        self.work.notify_waiters();
    }

    /// Whether a shut down has started.
    pub fn shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys ready for delivery, not counting delayed or in-flight keys.
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        state.promote(Instant::now());
        state.queue.len()
    }

    /// No key is ready for delivery.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::rate_limit::ItemExponentialFailureRateLimiter;
    use std::sync::Arc;

    fn queue() -> RateLimitingQueue<&'static str> {
        RateLimitingQueue::new(Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1),
        )))
    }

    #[tokio::test]
    async fn adds_are_deduplicated() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_requeues_on_done() {
        let q = queue();
        q.add("a");
        assert_eq!(q.get().await, Some("a"));

        q.add("a");
        // not delivered a second time while in flight
        assert_eq!(q.len(), 0);

        q.done(&"a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert_eq!(q.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_deadline() {
        let q = Arc::new(queue());
        q.add_after("a", Duration::from_secs(10));
        assert_eq!(q.len(), 0);

        let start = Instant::now();
        assert_eq!(q.get().await, Some("a"));
        assert!(Instant::now() - start >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_wins() {
        let q = queue();
        q.add_after("a", Duration::from_secs(60));
        q.add_after("a", Duration::from_secs(5));
        q.add_after("a", Duration::from_secs(30));

        let start = Instant::now();
        assert_eq!(q.get().await, Some("a"));
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(30));

        q.done(&"a");
        // the superseded deadlines do not deliver the key again
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(q.len(), 0);
        q.shut_down();
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_delay_is_deferred() {
        let q = queue();
        q.add_after("a", Duration::MAX);
        assert_eq!(q.len(), 0);

        // still overridable by an immediate add
        q.add("a");
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_add_overrides_delay() {
        let q = queue();
        q.add_after("a", Duration::from_secs(60));
        q.add("a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_worker_wakes_for_earlier_deadline() {
        let q = Arc::new(queue());
        q.add_after("late", Duration::from_secs(60));

        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add_after("early", Duration::from_secs(1));

        let start = Instant::now();
        assert_eq!(worker.await.unwrap(), Some("early"));
        assert!(Instant::now() - start < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off() {
        let q = queue();
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");

        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn shut_down_releases_waiting_workers() {
        let q = Arc::new(queue());
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        q.shut_down();
        assert!(q.shutting_down());
        for worker in workers {
            assert_eq!(worker.await.unwrap(), None);
        }

        // adds after shut down are ignored
        q.add("a");
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn shut_down_with_drain_waits_for_in_flight_keys() {
        let q = Arc::new(queue());
        q.add("a");
        q.add("b");
        assert_eq!(q.get().await, Some("a"));

        let drain = {
            let q = q.clone();
            tokio::spawn(async move { q.shut_down_with_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        // queued keys are still handed out while draining
        assert_eq!(q.get().await, Some("b"));
        q.done(&"a");
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        q.done(&"b");
        drain.await.unwrap();
        assert_eq!(q.get().await, None);
    }
}
