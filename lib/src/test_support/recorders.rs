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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::channels::CqEvent;
use crate::error::CqError;
use crate::managers::{DiagnosticKind, DiagnosticRecord, ObservabilitySink};
use crate::queries::{CqListener, ListenerError, ListenerHandle};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Listener that records everything it is handed.
///
/// Also flags any callback that starts while another one is still running.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<CqEvent>>,
    errors: Mutex<Vec<ListenerError>>,
    closes: AtomicUsize,
    in_callback: AtomicBool,
    overlaps: AtomicUsize,
    callback_delay: Option<Duration>,
    panic_on_sequence: Option<u64>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sleeps inside every `on_event`, simulating a slow consumer
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            callback_delay: Some(delay),
            ..Default::default()
        })
    }

    /// Panics from `on_event` when handed this sequence id
    pub fn panicking_on(sequence_id: u64) -> Arc<Self> {
        Arc::new(Self {
            panic_on_sequence: Some(sequence_id),
            ..Default::default()
        })
    }

    pub fn handle(self: &Arc<Self>, id: &str) -> ListenerHandle {
        ListenerHandle::new(id, self.clone())
    }

    pub fn event_count(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn events(&self) -> Vec<CqEvent> {
        lock(&self.events).clone()
    }

    pub fn sequence_ids(&self) -> Vec<u64> {
        lock(&self.events).iter().map(|e| e.sequence_id).collect()
    }

    pub fn errors(&self) -> Vec<ListenerError> {
        lock(&self.errors).clone()
    }

    pub fn gap_errors(&self) -> Vec<(u64, u64)> {
        self.stream_errors()
            .into_iter()
            .filter_map(|e| match &*e {
                CqError::CqEventGap {
                    expected, received, ..
                } => Some((*expected, *received)),
                _ => None,
            })
            .collect()
    }

    /// Client-side errors, in delivery order
    pub fn stream_errors(&self) -> Vec<Arc<CqError>> {
        lock(&self.errors)
            .iter()
            .filter_map(|e| match e {
                ListenerError::Stream(error) => Some(error.clone()),
                ListenerError::Server(_) => None,
            })
            .collect()
    }

    pub fn server_errors(&self) -> Vec<Arc<CqEvent>> {
        lock(&self.errors)
            .iter()
            .filter_map(|e| match e {
                ListenerError::Server(event) => Some(event.clone()),
                ListenerError::Stream(_) => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Callbacks that began while another was in progress
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` events arrived; false on timeout
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.event_count() >= count).await
    }

    pub async fn wait_for_errors(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || lock(&self.errors).len() >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn enter(&self) {
        if self.in_callback.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exit(&self) {
        self.in_callback.store(false, Ordering::SeqCst);
    }
}

impl CqListener for RecordingListener {
    fn on_event(&self, event: &CqEvent) {
        self.enter();
        if let Some(delay) = self.callback_delay {
            std::thread::sleep(delay);
        }
        lock(&self.events).push(event.clone());
        self.exit();

        if self.panic_on_sequence == Some(event.sequence_id) {
            panic!("listener rejected sequence {}", event.sequence_id);
        }
    }

    fn on_error(&self, error: &ListenerError) {
        self.enter();
        lock(&self.errors).push(error.clone());
        self.exit();
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink that keeps every diagnostic record
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<DiagnosticRecord>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<DiagnosticRecord> {
        lock(&self.records).clone()
    }

    pub fn count(&self, matches: impl Fn(&DiagnosticKind) -> bool) -> usize {
        lock(&self.records)
            .iter()
            .filter(|r| matches(&r.kind))
            .count()
    }

    pub fn promotions(&self) -> Vec<(String, String)> {
        lock(&self.records)
            .iter()
            .filter_map(|r| match &r.kind {
                DiagnosticKind::Promotion { from, to, .. } => Some((from.clone(), to.clone())),
                _ => None,
            })
            .collect()
    }
}

impl ObservabilitySink for RecordingSink {
    fn record(&self, record: DiagnosticRecord) {
        lock(&self.records).push(record);
    }
}
