// Copyright 2025 The GridCQ Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::events::Sequenced;
use log::{debug, trace};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Wrapper for queued events with sequence-based ordering
struct QueuedEvent<T>
where
    T: Sequenced + Send + Sync + 'static,
{
    event: Arc<T>,
}

impl<T> PartialEq for QueuedEvent<T>
where
    T: Sequenced + Send + Sync + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        self.event.sequence_id() == other.event.sequence_id()
    }
}

impl<T> Eq for QueuedEvent<T> where T: Sequenced + Send + Sync + 'static {}

impl<T> PartialOrd for QueuedEvent<T>
where
    T: Sequenced + Send + Sync + 'static,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedEvent<T>
where
    T: Sequenced + Send + Sync + 'static,
{
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior (lowest sequence first)
        other.event.sequence_id().cmp(&self.event.sequence_id())
    }
}

/// Metrics for monitoring queue behaviour (lock-free using atomics)
#[derive(Debug, Default)]
pub struct SequenceQueueMetrics {
    pub total_enqueued: AtomicU64,
    pub total_dequeued: AtomicU64,
    pub current_depth: AtomicUsize,
    pub max_depth_seen: AtomicUsize,
    pub drops_due_to_capacity: AtomicU64,
    /// Number of times enqueue_wait() blocked waiting for capacity
    pub blocked_enqueue_count: AtomicU64,
}

impl SequenceQueueMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_enqueued: self.total_enqueued.load(AtomicOrdering::Relaxed),
            total_dequeued: self.total_dequeued.load(AtomicOrdering::Relaxed),
            current_depth: self.current_depth.load(AtomicOrdering::Relaxed),
            max_depth_seen: self.max_depth_seen.load(AtomicOrdering::Relaxed),
            drops_due_to_capacity: self.drops_due_to_capacity.load(AtomicOrdering::Relaxed),
            blocked_enqueue_count: self.blocked_enqueue_count.load(AtomicOrdering::Relaxed),
        }
    }

    fn record_push(&self, current_depth: usize) {
        self.total_enqueued.fetch_add(1, AtomicOrdering::Relaxed);
        self.current_depth
            .store(current_depth, AtomicOrdering::Relaxed);

        let mut max_seen = self.max_depth_seen.load(AtomicOrdering::Relaxed);
        while current_depth > max_seen {
            match self.max_depth_seen.compare_exchange_weak(
                max_seen,
                current_depth,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => max_seen = x,
            }
        }
    }

    fn record_pop(&self, current_depth: usize) {
        self.total_dequeued.fetch_add(1, AtomicOrdering::Relaxed);
        self.current_depth
            .store(current_depth, AtomicOrdering::Relaxed);
    }
}

/// Non-atomic snapshot of queue metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub current_depth: usize,
    pub max_depth_seen: usize,
    pub drops_due_to_capacity: u64,
    pub blocked_enqueue_count: u64,
}

/// Thread-safe pending-event queue ordered by sequence id.
///
/// Any number of producers may enqueue concurrently; the queue is designed
/// for exactly one consumer, which always sees the lowest pending sequence id
/// first. Producers that use `enqueue_wait()` are held back when the queue is
/// full, which pushes backpressure onto the network receive path and never
/// onto the consumer.
pub struct SequenceQueue<T>
where
    T: Sequenced + Send + Sync + 'static,
{
    heap: Arc<Mutex<BinaryHeap<QueuedEvent<T>>>>,
    /// Signalled on every enqueue
    not_empty: Arc<Notify>,
    /// Signalled on every dequeue
    not_full: Arc<Notify>,
    max_capacity: usize,
    metrics: Arc<SequenceQueueMetrics>,
}

impl<T> SequenceQueue<T>
where
    T: Sequenced + Send + Sync + Debug + 'static,
{
    pub fn new(max_capacity: usize) -> Self {
        Self {
            heap: Arc::new(Mutex::new(BinaryHeap::new())),
            not_empty: Arc::new(Notify::new()),
            not_full: Arc::new(Notify::new()),
            max_capacity,
            metrics: Arc::new(SequenceQueueMetrics::default()),
        }
    }

    /// Enqueue an event without waiting.
    /// Returns false if the queue is at capacity and the event was dropped.
    pub async fn enqueue(&self, event: Arc<T>) -> bool {
        let mut heap = self.heap.lock().await;

        if heap.len() >= self.max_capacity {
            let total_drops = self
                .metrics
                .drops_due_to_capacity
                .fetch_add(1, AtomicOrdering::Relaxed)
                + 1;

            if total_drops == 1 || total_drops % 100 == 0 {
                debug!(
                    "Sequence queue at capacity ({}); {} events dropped so far",
                    self.max_capacity, total_drops
                );
            } else {
                trace!(
                    "Sequence queue drop (capacity {}): {:?}",
                    self.max_capacity,
                    event
                );
            }
            return false;
        }

        heap.push(QueuedEvent { event });
        self.metrics.record_push(heap.len());
        drop(heap);

        self.not_empty.notify_one();
        true
    }

    /// Enqueue an event, waiting until there is capacity.
    pub async fn enqueue_wait(&self, event: Arc<T>) {
        loop {
            let mut heap = self.heap.lock().await;

            if heap.len() < self.max_capacity {
                heap.push(QueuedEvent { event });
                self.metrics.record_push(heap.len());
                drop(heap);

                self.not_empty.notify_one();
                return;
            }

            let blocked_count = self
                .metrics
                .blocked_enqueue_count
                .fetch_add(1, AtomicOrdering::Relaxed)
                + 1;

            if blocked_count == 1 || blocked_count % 100 == 0 {
                debug!(
                    "Sequence queue enqueue blocked (capacity {}); blocked {} times so far",
                    self.max_capacity, blocked_count
                );
            }

            // Register interest before releasing the lock so a dequeue in between is not missed
            let notified = self.not_full.notified();
            drop(heap);
            notified.await;
        }
    }

    /// Dequeue the lowest-sequence event (non-blocking)
    pub async fn try_dequeue(&self) -> Option<Arc<T>> {
        let mut heap = self.heap.lock().await;
        let event = heap.pop().map(|queued| queued.event);

        if event.is_some() {
            self.metrics.record_pop(heap.len());
            drop(heap);
            self.not_full.notify_one();
        }

        event
    }

    /// Sequence id at the head of the queue, if any
    async fn peek_sequence(&self) -> Option<u64> {
        let heap = self.heap.lock().await;
        heap.peek().map(|queued| queued.event.sequence_id())
    }

    /// Wait until the queue is non-empty and return the head sequence id
    pub async fn peek_wait(&self) -> u64 {
        loop {
            let notified = self.not_empty.notified();
            if let Some(sequence_id) = self.peek_sequence().await {
                return sequence_id;
            }
            notified.await;
        }
    }

    /// Resolve on the next enqueue
    pub async fn enqueued(&self) {
        self.not_empty.notified().await;
    }

    pub async fn depth(&self) -> usize {
        let heap = self.heap.lock().await;
        heap.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Drain all events from the queue in sequence order (for shutdown)
    pub async fn drain(&self) -> Vec<Arc<T>> {
        let mut heap = self.heap.lock().await;
        let mut events = Vec::with_capacity(heap.len());
        while let Some(queued) = heap.pop() {
            events.push(queued.event);
        }

        self.metrics.current_depth.store(0, AtomicOrdering::Relaxed);
        drop(heap);
        self.not_full.notify_waiters();

        debug!("Drained {} events from sequence queue", events.len());
        events
    }
}

impl<T> Clone for SequenceQueue<T>
where
    T: Sequenced + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            heap: Arc::clone(&self.heap),
            not_empty: Arc::clone(&self.not_empty),
            not_full: Arc::clone(&self.not_full),
            max_capacity: self.max_capacity,
            metrics: Arc::clone(&self.metrics),
        }
    }
}
