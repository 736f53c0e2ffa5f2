//! A work queue that keeps the causal history of deduplicated work.
//!
//! A controller work queue collapses repeated adds of one key into a single
//! delivery. [`TracingQueue`] keeps that contract and additionally remembers
//! *why* the key was added: the first trigger becomes the unit's parent and
//! every other distinct trigger is recorded as a linked span, so a single
//! reconcile can be traced back to all the changes that caused it.
//!
//! # Examples
//!
//! ```
//! use opentelemetry_operator_trace::{ResourceKey, TracingQueue, UnitOfWork, UnitParent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = TracingQueue::new();
//! let key = ResourceKey::new("default", "web");
//!
//! let parent = |trace_id: &str| UnitParent {
//!     trace_id: trace_id.into(),
//!     span_id: "00f067aa0ba902b7".into(),
//!     ..Default::default()
//! };
//! queue.add(UnitOfWork::new(key.clone()).with_parent(parent("4bf92f3577b34da6a3ce929d0e0e4736")));
//! queue.add(UnitOfWork::new(key.clone()).with_parent(parent("5bf92f3577b34da6a3ce929d0e0e4736")));
//!
//! let unit = queue.get().await.unwrap();
//! assert_eq!(unit.linked_spans.len(), 1);
//! queue.done(&unit);
//! # }
//! ```
pub mod rate_limit;
pub mod workqueue;

use crate::unit::{ResourceKey, UnitOfWork};
use opentelemetry::otel_debug;
use rate_limit::RateLimiter;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use workqueue::RateLimitingQueue;

#[derive(Debug, Default)]
struct Units {
    // next delivery per key
    pending: HashMap<ResourceKey, UnitOfWork>,
    // delivered but not yet done
    in_flight: HashMap<ResourceKey, UnitOfWork>,
}

/// Deduplicating work queue of [`UnitOfWork`]s.
///
/// At most one unit per key is out for processing at a time. Adds made while
/// a key is being processed only shape the next delivery of that key.
#[derive(Debug)]
pub struct TracingQueue {
    units: Mutex<Units>,
    queue: RateLimitingQueue<ResourceKey>,
}

impl Default for TracingQueue {
    fn default() -> Self {
        TracingQueue {
            units: Mutex::new(Units::default()),
            queue: RateLimitingQueue::default(),
        }
    }
}

impl TracingQueue {
    /// Queue backed by the default controller rate limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue whose [`add_rate_limited`](Self::add_rate_limited) delays come
    /// from `rate_limiter`.
    pub fn with_rate_limiter(rate_limiter: Box<dyn RateLimiter<ResourceKey>>) -> Self {
        TracingQueue {
            units: Mutex::new(Units::default()),
            queue: RateLimitingQueue::new(rate_limiter),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Units> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // returns the key to hand to the backing queue
    fn merge(units: &mut Units, unit: UnitOfWork) -> ResourceKey {
        match units.pending.get_mut(&unit.key) {
            Some(existing) => {
                existing.merge_parent(&unit.parent);
                unit.key
            }
            None => {
                let key = unit.key.clone();
                units.pending.insert(key.clone(), unit);
                key
            }
        }
    }

    /// Queue `unit` for immediate delivery.
    ///
    /// When a unit is already pending for the key, the new unit's parent is
    /// recorded on it as a linked span instead.
    pub fn add(&self, unit: UnitOfWork) {
        let mut units = self.lock();
        if self.queue.shutting_down() {
            return;
        }
        let key = Self::merge(&mut units, unit);
        self.queue.add(key);
    }

    /// Queue `unit` after `delay`, starting a fresh causal chain.
    ///
    /// Ignored when a unit is already pending for the key.
    pub fn add_after(&self, mut unit: UnitOfWork, delay: Duration) {
        let mut units = self.lock();
        if self.queue.shutting_down() || units.pending.contains_key(&unit.key) {
            return;
        }
        unit.reset_causality();
        let key = unit.key.clone();
        units.pending.insert(key.clone(), unit);
        self.queue.add_after(key, delay);
    }

    /// Like [`add`](Self::add), but delivered after the rate limiter's delay.
    pub fn add_rate_limited(&self, unit: UnitOfWork) {
        let mut units = self.lock();
        if self.queue.shutting_down() {
            return;
        }
        let key = Self::merge(&mut units, unit);
        self.queue.add_rate_limited(key);
    }

    /// Reset the retry history of `unit`'s key.
    ///
    /// A unit pending for the key is kept, together with the links recorded
    /// on it while `unit` was processed.
    pub fn forget(&self, unit: &UnitOfWork) {
        self.queue.forget(&unit.key);
    }

    /// Rate limited retries of `unit`'s key since it was last forgotten.
    pub fn num_requeues(&self, unit: &UnitOfWork) -> usize {
        self.queue.num_requeues(&unit.key)
    }

    /// Wait for the next unit. Returns `None` once the queue is shut down.
    ///
    /// The unit carries every distinct trigger collapsed onto it since the
    /// key was last delivered. Call [`done`](Self::done) when finished.
    pub async fn get(&self) -> Option<UnitOfWork> {
        let key = self.queue.get().await?;

        let mut units = self.lock();
        let unit = match units.pending.remove(&key) {
            Some(unit) => unit,
            // delivered again without a new add, e.g. after an earlier done
            // raced this get
            None => units
                .in_flight
                .get(&key)
                .cloned()
                .unwrap_or_else(|| UnitOfWork::new(key.clone())),
        };
        units.in_flight.insert(key, unit.clone());
        Some(unit)
    }

    /// Mark `unit` as processed. A key added again during processing is
    /// delivered again.
    pub fn done(&self, unit: &UnitOfWork) {
        let mut units = self.lock();
        self.queue.done(&unit.key);
        units.in_flight.remove(&unit.key);
    }

    /// Number of units waiting for delivery.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// No unit is waiting for delivery.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out units. Waiting workers receive `None`.
    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    /// Hand out the units already queued, wait until each is done, then
    /// forget all pending state.
    pub async fn shut_down_with_drain(&self) {
        self.queue.shut_down_with_drain().await;

        let mut units = self.lock();
        let dropped = units.pending.len();
        units.pending.clear();
        units.in_flight.clear();
        otel_debug!(
            name: "TracingQueue.Drained",
            dropped_units = dropped as u64,
        );
    }

    /// Whether a shut down has started.
    pub fn shutting_down(&self) -> bool {
        self.queue.shutting_down()
    }
}
