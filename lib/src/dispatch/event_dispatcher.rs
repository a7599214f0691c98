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

//! Single-consumer delivery of CQ events to listener callbacks.
//!
//! Producers (one forwarder per server stream) push into a shared
//! [`SequenceQueue`]. Exactly one task per CQ drains it, so callback
//! invocation is serialized by construction. On each head event:
//!
//! - `seq <= last_delivered`: duplicate from a failover re-sync, discarded
//! - `seq == last_delivered + 1`: delivered, `last_delivered` advances
//! - `seq > last_delivered + 1`: gap; the task waits up to the grace
//!   interval for the missing ids, then reports one `CqEventGap` and
//!   fast-forwards to the received id

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::Instrument;

use crate::channels::{CqEvent, MetricsSnapshot, SequenceQueue};
use crate::error::CqError;
use crate::managers::{DiagnosticKind, DiagnosticRecord, ObservabilitySink};
use crate::queries::{CqAttributes, CqStatistics, ListenerError};

/// Everything the consumer task needs, shared with the owning query
pub struct DispatcherContext {
    pub cq_name: String,
    pub attributes: Arc<RwLock<Arc<CqAttributes>>>,
    pub statistics: Arc<CqStatistics>,
    /// Survives stop/start so a restarted query resumes after the last delivered id
    pub last_delivered: Arc<AtomicU64>,
    pub sink: Arc<dyn ObservabilitySink>,
    pub gap_grace_interval: Duration,
    pub queue_capacity: usize,
}

/// Cloneable handle for reporting client-side errors to a CQ's listeners.
///
/// Errors travel to the dispatcher task and are delivered from there, so
/// `on_error` never runs concurrently with `on_event`.
#[derive(Clone)]
pub struct ErrorReporter {
    cq_name: String,
    tx: mpsc::UnboundedSender<ListenerError>,
}

impl ErrorReporter {
    pub fn report(&self, error: CqError) {
        if self.tx.send(ListenerError::stream(error)).is_err() {
            debug!("[{}] Dispatcher stopped; dropping error notice", self.cq_name);
        }
    }
}

/// Running dispatcher for one CQ
pub struct EventDispatcher {
    cq_name: String,
    queue: SequenceQueue<CqEvent>,
    last_delivered: Arc<AtomicU64>,
    notice_tx: mpsc::UnboundedSender<ListenerError>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl EventDispatcher {
    /// Spawn the consumer task
    pub fn spawn(context: DispatcherContext) -> Self {
        let queue = SequenceQueue::new(context.queue_capacity);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let cq_name = context.cq_name.clone();
        let last_delivered = context.last_delivered.clone();

        let span = tracing::info_span!(
            "cq_dispatcher",
            cq_name = %cq_name,
            component_type = "dispatcher"
        );
        let consumer = Consumer {
            context,
            queue: queue.clone(),
            notice_rx,
        };
        let task_handle = tokio::spawn(consumer.run(shutdown_rx).instrument(span));

        Self {
            cq_name,
            queue,
            last_delivered,
            notice_tx,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        }
    }

    /// Producer handle for stream forwarders
    pub fn intake(&self) -> SequenceQueue<CqEvent> {
        self.queue.clone()
    }

    pub fn last_delivered_sequence_id(&self) -> u64 {
        self.last_delivered.load(Ordering::Acquire)
    }

    /// Queue a client-side error for the listeners' `on_error`
    pub fn report_error(&self, error: CqError) {
        self.error_reporter().report(error);
    }

    pub fn error_reporter(&self) -> ErrorReporter {
        ErrorReporter {
            cq_name: self.cq_name.clone(),
            tx: self.notice_tx.clone(),
        }
    }

    pub async fn pending(&self) -> usize {
        self.queue.depth().await
    }

    pub fn queue_metrics(&self) -> MetricsSnapshot {
        self.queue.metrics()
    }

    /// Stop the consumer task and discard undelivered events.
    /// Returns the number of events discarded.
    pub async fn stop(&mut self, timeout: Duration) -> usize {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.task_handle.take() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {
                    debug!("[{}] Dispatcher task completed", self.cq_name);
                }
                Ok(Err(e)) => {
                    error!("[{}] Dispatcher task panicked: {}", self.cq_name, e);
                }
                Err(_) => {
                    error!(
                        "[{}] Dispatcher task did not complete within timeout",
                        self.cq_name
                    );
                }
            }
        }

        let discarded = self.queue.drain().await.len();
        if discarded > 0 {
            info!(
                "[{}] Discarded {} undelivered events on stop",
                self.cq_name, discarded
            );
        }
        discarded
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

struct Consumer {
    context: DispatcherContext,
    queue: SequenceQueue<CqEvent>,
    notice_rx: mpsc::UnboundedReceiver<ListenerError>,
}

impl Consumer {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        let cq_name = self.context.cq_name.clone();
        info!(
            "[{cq_name}] Dispatcher started after sequence {}",
            self.last_delivered()
        );

        let mut gap_deadline: Option<Instant> = None;

        loop {
            let head = tokio::select! {
                biased;

                _ = &mut shutdown_rx => break,

                Some(notice) = self.notice_rx.recv() => {
                    self.deliver_error(&notice).await;
                    continue;
                }

                head = self.queue.peek_wait() => head,
            };

            let last = self.last_delivered();
            if head > last + 1 {
                let deadline =
                    *gap_deadline.get_or_insert_with(|| Instant::now() + self.context.gap_grace_interval);

                if Instant::now() < deadline {
                    trace!("[{cq_name}] Waiting for sequence {} (head {head})", last + 1);
                    tokio::select! {
                        biased;

                        _ = &mut shutdown_rx => break,

                        Some(notice) = self.notice_rx.recv() => {
                            self.deliver_error(&notice).await;
                        }

                        _ = self.queue.enqueued() => {}

                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                    continue;
                }

                self.report_gap(last + 1, head).await;
                self.context
                    .last_delivered
                    .store(head - 1, Ordering::Release);
            }
            gap_deadline = None;

            let Some(event) = self.queue.try_dequeue().await else {
                continue;
            };
            self.process(event).await;
        }

        info!(
            "[{cq_name}] Dispatcher stopped at sequence {}",
            self.last_delivered()
        );
    }

    fn last_delivered(&self) -> u64 {
        self.context.last_delivered.load(Ordering::Acquire)
    }

    async fn process(&self, event: Arc<CqEvent>) {
        let last = self.last_delivered();
        let seq = event.sequence_id;

        if seq <= last {
            trace!(
                "[{}] Discarding duplicate sequence {seq} (last delivered {last})",
                self.context.cq_name
            );
            self.context.statistics.record_duplicate();
            return;
        }

        if seq > last + 1 {
            // Only reachable if another consumer touched the queue
            warn!(
                "[{}] Out-of-order sequence {seq} after {last}; requeueing",
                self.context.cq_name
            );
            if !self.queue.enqueue(event).await {
                error!(
                    "[{}] Could not requeue sequence {seq}; queue full",
                    self.context.cq_name
                );
            }
            return;
        }

        if event.is_error() {
            self.context.statistics.record_error();
            self.deliver_error(&ListenerError::Server(event.clone())).await;
        } else {
            self.context.statistics.record_event(event.operation);
            self.deliver_event(&event).await;
        }
        self.context.last_delivered.store(seq, Ordering::Release);
    }

    async fn report_gap(&self, expected: u64, received: u64) {
        let cq_name = &self.context.cq_name;
        warn!("[{cq_name}] Sequence {expected} not received within grace interval; resuming at {received}");

        self.context.statistics.record_gap();
        self.context.sink.record(DiagnosticRecord::new(
            cq_name.as_str(),
            DiagnosticKind::GapDetected { expected, received },
        ));
        let notice = ListenerError::stream(CqError::event_gap(cq_name.as_str(), expected, received));
        self.deliver_error(&notice).await;
    }

    async fn deliver_event(&self, event: &CqEvent) {
        let attributes = self.context.attributes.read().await.clone();
        for handle in attributes.listeners() {
            let listener = handle.listener();
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if let Err(panic) = result {
                self.record_panic(handle.id(), panic_message(&*panic));
            }
        }
    }

    async fn deliver_error(&self, notice: &ListenerError) {
        let attributes = self.context.attributes.read().await.clone();
        for handle in attributes.listeners() {
            let listener = handle.listener();
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_error(notice)));
            if let Err(panic) = result {
                self.record_panic(handle.id(), panic_message(&*panic));
            }
        }
    }

    fn record_panic(&self, listener_id: &str, message: String) {
        error!(
            "[{}] Listener '{listener_id}' panicked: {message}",
            self.context.cq_name
        );
        self.context.statistics.record_listener_panic();
        self.context.sink.record(DiagnosticRecord::new(
            self.context.cq_name.as_str(),
            DiagnosticKind::ListenerPanic {
                message: format!("{listener_id}: {message}"),
            },
        ));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
