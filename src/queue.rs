//! Bounded, ordered hand-off between sample producers and the flusher.
//!
//! `DeliveryQueue` is the only place samples wait while graphite is slow or
//! away. Producers may be any number of threads calling `enqueue`; exactly
//! one consumer, the `sink::Flusher`, removes from the front. `enqueue` never
//! blocks on anything but the queue's own short critical section and never
//! fails: once the queue is full the configured `OverflowPolicy` decides which
//! sample gives way, and the loss is counted.

use crate::metric::Sample;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// What to discard when the queue is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest unsent sample to admit the newest. The queue always
    /// holds the most recent `capacity` samples.
    DropOldest,
    /// Discard the incoming sample. The queue always holds the oldest unsent
    /// `capacity` samples.
    RejectNewest,
}

impl Default for OverflowPolicy {
    fn default() -> OverflowPolicy {
        OverflowPolicy::DropOldest
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<OverflowPolicy, String> {
        match s {
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            "reject-newest" => Ok(OverflowPolicy::RejectNewest),
            other => Err(format!(
                "unknown overflow policy '{}', expected 'drop-oldest' or 'reject-newest'",
                other
            )),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OverflowPolicy::DropOldest => write!(f, "drop-oldest"),
            OverflowPolicy::RejectNewest => write!(f, "reject-newest"),
        }
    }
}

/// Point-in-time counters for a `DeliveryQueue`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Samples currently waiting.
    pub depth: usize,
    /// Samples admitted over the queue's lifetime.
    pub enqueued: usize,
    /// Samples discarded by the overflow policy.
    pub dropped: usize,
    /// Samples discarded because the queue was closed.
    pub rejected_after_close: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicUsize,
    dropped: AtomicUsize,
    rejected_after_close: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    samples: VecDeque<Sample>,
    closed: bool,
}

/// A bounded FIFO of `Sample`s. Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Counters>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

impl DeliveryQueue {
    /// Create a queue holding at most `capacity` samples. A `capacity` of zero
    /// is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> DeliveryQueue {
        DeliveryQueue {
            inner: Arc::new(Mutex::new(Inner::default())),
            counters: Arc::new(Counters::default()),
            capacity: if capacity == 0 { 1 } else { capacity },
            policy: policy,
        }
    }

    // A producer that panicked mid-push cannot leave the deque itself in a
    // torn state, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hand `sample` to the queue. Never blocks on I/O, never fails.
    ///
    /// At capacity the overflow policy discards one sample, counted in
    /// `QueueStats::dropped`. After `close` every sample is discarded and
    /// counted in `QueueStats::rejected_after_close`.
    pub fn enqueue(&self, sample: Sample) {
        let mut inner = self.lock();
        if inner.closed {
            self.counters
                .rejected_after_close
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        if inner.samples.len() >= self.capacity {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                OverflowPolicy::DropOldest => {
                    let _ = inner.samples.pop_front();
                }
                OverflowPolicy::RejectNewest => {
                    trace!("queue full, rejecting sample for {}", sample.path());
                    return;
                }
            }
        }
        inner.samples.push_back(sample);
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove and return up to `max` samples from the front, in enqueue order.
    ///
    /// Consumer only.
    pub fn dequeue_batch(&self, max: usize) -> Vec<Sample> {
        let mut inner = self.lock();
        let n = if max < inner.samples.len() {
            max
        } else {
            inner.samples.len()
        };
        inner.samples.drain(..n).collect()
    }

    /// Put a batch that failed delivery back at the front, in its original
    /// order, ahead of anything enqueued since it was taken.
    ///
    /// Consumer only. If producers filled the queue in the meantime the
    /// overflow policy trims the excess: `DropOldest` from the front,
    /// `RejectNewest` from the back. Works on a closed queue.
    pub fn requeue_front(&self, batch: Vec<Sample>) {
        let mut inner = self.lock();
        for sample in batch.into_iter().rev() {
            inner.samples.push_front(sample);
        }
        let len = inner.samples.len();
        if len > self.capacity {
            let excess = len - self.capacity;
            match self.policy {
                OverflowPolicy::DropOldest => {
                    let _ = inner.samples.drain(..excess);
                }
                OverflowPolicy::RejectNewest => {
                    inner.samples.truncate(self.capacity);
                }
            }
            self.counters.dropped.fetch_add(excess, Ordering::Relaxed);
        }
    }

    /// Stop admitting samples. Samples already queued stay available to the
    /// consumer.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of samples waiting.
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    /// Whether no samples are waiting.
    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    /// The maximum number of samples the queue holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The configured overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Snapshot of the queue's counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.len(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            rejected_after_close: self
                .counters
                .rejected_after_close
                .load(Ordering::Relaxed),
        }
    }
}
