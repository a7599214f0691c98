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

//! CQ lifecycle history with live streaming support.
//!
//! Queries, channels and the failover coordinator report lifecycle changes
//! (start, stop, promotion, degradation) through a [`LifecycleRecorder`].
//! The history keeps a bounded window per CQ and broadcasts each event to
//! live subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use tokio::sync::{broadcast, RwLock};

use crate::channels::{CqLifecycleEvent, CqState, LifecycleKind};

/// Default maximum number of events to retain per CQ.
pub const DEFAULT_MAX_EVENTS_PER_CQ: usize = 100;

/// Default broadcast channel capacity for live event streaming.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Per-CQ event storage and broadcast channel.
struct CqEventChannel {
    history: VecDeque<CqLifecycleEvent>,
    max_history: usize,
    sender: broadcast::Sender<CqLifecycleEvent>,
}

impl CqEventChannel {
    fn new(max_history: usize, channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        Self {
            history: VecDeque::with_capacity(max_history),
            max_history,
            sender,
        }
    }

    fn record(&mut self, event: CqLifecycleEvent) {
        if self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());

        // No live subscribers is fine
        let _ = self.sender.send(event);
    }

    fn get_history(&self) -> Vec<CqLifecycleEvent> {
        self.history.iter().cloned().collect()
    }

    fn get_last_error(&self) -> Option<String> {
        self.history
            .iter()
            .rev()
            .find(|event| event.kind == LifecycleKind::Error)
            .and_then(|event| event.message.clone())
    }
}

/// Stores CQ lifecycle history with a bounded size per CQ.
pub struct CqEventHistory {
    channels: HashMap<String, CqEventChannel>,
    max_events_per_cq: usize,
    channel_capacity: usize,
}

impl std::fmt::Debug for CqEventHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqEventHistory")
            .field("max_events_per_cq", &self.max_events_per_cq)
            .field("cq_count", &self.channels.len())
            .finish()
    }
}

impl Default for CqEventHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl CqEventHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS_PER_CQ, DEFAULT_EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(max_events_per_cq: usize, channel_capacity: usize) -> Self {
        Self {
            channels: HashMap::new(),
            max_events_per_cq,
            channel_capacity,
        }
    }

    /// Record an event, evicting the oldest one for that CQ when full.
    pub fn record_event(&mut self, event: CqLifecycleEvent) {
        let max = self.max_events_per_cq;
        let capacity = self.channel_capacity;
        self.channels
            .entry(event.cq_name.clone())
            .or_insert_with(|| CqEventChannel::new(max, capacity))
            .record(event);
    }

    /// Events for one CQ, oldest first.
    pub fn get_events(&self, cq_name: &str) -> Vec<CqLifecycleEvent> {
        self.channels
            .get(cq_name)
            .map(|channel| channel.get_history())
            .unwrap_or_default()
    }

    /// Current history plus a receiver for subsequent events.
    pub fn subscribe(
        &mut self,
        cq_name: &str,
    ) -> (Vec<CqLifecycleEvent>, broadcast::Receiver<CqLifecycleEvent>) {
        let max = self.max_events_per_cq;
        let capacity = self.channel_capacity;
        let channel = self
            .channels
            .entry(cq_name.to_string())
            .or_insert_with(|| CqEventChannel::new(max, capacity));
        (channel.get_history(), channel.sender.subscribe())
    }

    pub fn get_last_error(&self, cq_name: &str) -> Option<String> {
        self.channels
            .get(cq_name)
            .and_then(|channel| channel.get_last_error())
    }

    /// Events across all CQs sorted by timestamp.
    pub fn get_all_events(&self) -> Vec<CqLifecycleEvent> {
        let mut all_events: Vec<CqLifecycleEvent> = self
            .channels
            .values()
            .flat_map(|channel| channel.get_history())
            .collect();
        all_events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        all_events
    }

    pub fn remove_cq(&mut self, cq_name: &str) {
        self.channels.remove(cq_name);
    }

    pub fn event_count(&self, cq_name: &str) -> usize {
        self.channels
            .get(cq_name)
            .map(|channel| channel.history.len())
            .unwrap_or(0)
    }
}

/// Cloneable handle components use to report lifecycle changes.
#[derive(Clone, Debug)]
pub struct LifecycleRecorder {
    history: Arc<RwLock<CqEventHistory>>,
}

impl LifecycleRecorder {
    pub fn new(max_events_per_cq: usize) -> Self {
        Self {
            history: Arc::new(RwLock::new(CqEventHistory::with_capacity(
                max_events_per_cq,
                DEFAULT_EVENT_CHANNEL_CAPACITY,
            ))),
        }
    }

    pub async fn emit(
        &self,
        cq_name: &str,
        kind: LifecycleKind,
        state: CqState,
        message: Option<String>,
    ) {
        debug!("CQ '{cq_name}' lifecycle {kind:?} ({state})");
        let event = CqLifecycleEvent::new(cq_name, kind, state, message);
        self.history.write().await.record_event(event);
    }

    pub async fn events(&self, cq_name: &str) -> Vec<CqLifecycleEvent> {
        self.history.read().await.get_events(cq_name)
    }

    pub async fn all_events(&self) -> Vec<CqLifecycleEvent> {
        self.history.read().await.get_all_events()
    }

    pub async fn last_error(&self, cq_name: &str) -> Option<String> {
        self.history.read().await.get_last_error(cq_name)
    }

    pub async fn subscribe(
        &self,
        cq_name: &str,
    ) -> (Vec<CqLifecycleEvent>, broadcast::Receiver<CqLifecycleEvent>) {
        self.history.write().await.subscribe(cq_name)
    }
}

impl Default for LifecycleRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS_PER_CQ)
    }
}
