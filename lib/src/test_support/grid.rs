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

//! In-process stand-in for a grid of cache servers.
//!
//! Each CQ name has one server-side event log with its own sequence
//! counter, shared by every server the way a replicated region would be.
//! Streams opened as primaries replay the log after `resume_from` and then
//! receive new events live; standby streams stay silent until resumed.
//! Killing a server drops its stream senders, which the client observes as
//! a disconnect once the already-sent events have been read.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;

use crate::channels::{ChangeDispatcher, ChannelChangeDispatcher, CqEvent, CqOperation};
use crate::transport::{
    EndpointDiscovery, InitialResult, ServerAddress, ServerConnectionRef, ServerConnector,
    ServerStream, StreamControl, StreamRequest, StreamRole,
};

const STREAM_CAPACITY: usize = 65_536;

struct ServerEntry {
    address: ServerAddress,
    alive: bool,
    liveness: Arc<AtomicBool>,
    refuse_streams: bool,
    opened: usize,
}

#[derive(Default)]
struct CqLog {
    last_sequence: u64,
    events: Vec<Arc<CqEvent>>,
    current: BTreeMap<String, serde_json::Value>,
}

struct StreamEntry {
    cq_name: String,
    server: ServerAddress,
    dispatcher: ChannelChangeDispatcher<CqEvent>,
    role: StreamRole,
    active: bool,
    registered: bool,
}

#[derive(Default)]
struct GridState {
    servers: Vec<ServerEntry>,
    logs: HashMap<String, CqLog>,
    streams: HashMap<u64, StreamEntry>,
    open_delay: Option<Duration>,
    resume_delay: Option<Duration>,
}

impl GridState {
    fn server(&self, address: &ServerAddress) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| &s.address == address)
    }

    fn server_mut(&mut self, address: &ServerAddress) -> Option<&mut ServerEntry> {
        self.servers.iter_mut().find(|s| &s.address == address)
    }

    fn replay(&self, stream: &StreamEntry, after: u64) {
        if let Some(log) = self.logs.get(&stream.cq_name) {
            for event in log.events.iter().filter(|e| e.sequence_id > after) {
                let _ = stream.dispatcher.try_dispatch_change(event.clone());
            }
        }
    }

    fn fan_out(&self, event: &Arc<CqEvent>) {
        for stream in self.streams.values() {
            if stream.cq_name == event.cq_name && stream.active {
                let _ = stream.dispatcher.try_dispatch_change(event.clone());
            }
        }
    }

    fn append(&mut self, cq_name: &str, build: impl FnOnce(u64) -> Option<CqEvent>) -> u64 {
        let log = self.logs.entry(cq_name.to_string()).or_default();
        log.last_sequence += 1;
        let sequence_id = log.last_sequence;

        let Some(event) = build(sequence_id) else {
            return sequence_id;
        };
        match (&event.operation, &event.value_after) {
            (CqOperation::Destroy | CqOperation::Invalidate, _) => {
                log.current.remove(&event.region_key);
            }
            (_, Some(value)) if !event.is_error() => {
                log.current.insert(event.region_key.clone(), value.clone());
            }
            _ => {}
        }

        let event = Arc::new(event);
        log.events.push(event.clone());
        self.fan_out(&event);
        sequence_id
    }
}

/// Shared handle to the simulated grid; implements both discovery and transport
#[derive(Clone, Default)]
pub struct InMemoryGrid {
    state: Arc<Mutex<GridState>>,
    next_stream_id: Arc<AtomicU64>,
}

impl InMemoryGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grid with servers `server-1` .. `server-{count}`, ranked in that order
    pub fn with_servers(count: usize) -> Self {
        let grid = Self::new();
        for i in 1..=count {
            grid.add_server(format!("server-{i}"));
        }
        grid
    }

    fn lock(&self) -> MutexGuard<'_, GridState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_server(&self, address: impl Into<ServerAddress>) {
        self.lock().servers.push(ServerEntry {
            address: address.into(),
            alive: true,
            liveness: Arc::new(AtomicBool::new(true)),
            refuse_streams: false,
            opened: 0,
        });
    }

    /// Take a server down, dropping every stream it serves
    pub fn kill_server(&self, address: impl Into<ServerAddress>) {
        let address = address.into();
        let mut state = self.lock();
        if let Some(server) = state.server_mut(&address) {
            server.alive = false;
            server.liveness.store(false, Ordering::Release);
        }
        state.streams.retain(|_, stream| stream.server != address);
        debug!("Grid: killed {address}");
    }

    pub fn restart_server(&self, address: impl Into<ServerAddress>) {
        let address = address.into();
        if let Some(server) = self.lock().server_mut(&address) {
            server.alive = true;
            // Connections from before the restart stay dead
            server.liveness = Arc::new(AtomicBool::new(true));
        }
    }

    /// Make a live server reject new streams
    pub fn refuse_streams(&self, address: impl Into<ServerAddress>, refuse: bool) {
        if let Some(server) = self.lock().server_mut(&address.into()) {
            server.refuse_streams = refuse;
        }
    }

    /// Delay every stream open, simulating a slow handshake
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.lock().open_delay = delay;
    }

    /// Delay every resume request, simulating a slow promotion
    pub fn set_resume_delay(&self, delay: Option<Duration>) {
        self.lock().resume_delay = delay;
    }

    /// Forget the predicate registration on every stream a server holds for a CQ
    pub fn drop_registration(&self, address: impl Into<ServerAddress>, cq_name: &str) {
        let address = address.into();
        for stream in self.lock().streams.values_mut() {
            if stream.server == address && stream.cq_name == cq_name {
                stream.registered = false;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Apply a matching mutation; returns its sequence id
    pub fn publish(
        &self,
        cq_name: &str,
        key: impl Into<String>,
        operation: CqOperation,
        value: Option<serde_json::Value>,
    ) -> u64 {
        let key = key.into();
        let mut state = self.lock();
        let before = state
            .logs
            .get(cq_name)
            .and_then(|log| log.current.get(&key).cloned());
        state.append(cq_name, |seq| {
            Some(CqEvent::change(cq_name, seq, key, operation, before, value))
        })
    }

    /// Publish `count` creates with keys `key-{seq}`; returns the last sequence id
    pub fn publish_creates(&self, cq_name: &str, count: usize) -> u64 {
        let mut last = 0;
        for i in 0..count {
            last = self.publish(
                cq_name,
                format!("key-{i}"),
                CqOperation::Create,
                Some(serde_json::json!({ "ID": i })),
            );
        }
        last
    }

    pub fn publish_server_error(&self, cq_name: &str, message: &str) -> u64 {
        self.lock()
            .append(cq_name, |seq| Some(CqEvent::server_error(cq_name, seq, message)))
    }

    /// Consume a sequence id without ever producing its event
    pub fn skip_sequence(&self, cq_name: &str) -> u64 {
        self.lock().append(cq_name, |_| None)
    }

    /// Push an event straight onto every live stream a server holds for the
    /// CQ, active or not, bypassing the log
    pub fn inject(&self, address: impl Into<ServerAddress>, event: CqEvent) {
        let address = address.into();
        let event = Arc::new(event);
        for stream in self.lock().streams.values() {
            if stream.server == address && stream.cq_name == event.cq_name {
                let _ = stream.dispatcher.try_dispatch_change(event.clone());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    pub fn last_sequence(&self, cq_name: &str) -> u64 {
        self.lock()
            .logs
            .get(cq_name)
            .map(|log| log.last_sequence)
            .unwrap_or(0)
    }

    /// Open streams for a CQ
    pub fn stream_count(&self, cq_name: &str) -> usize {
        self.lock()
            .streams
            .values()
            .filter(|s| s.cq_name == cq_name)
            .count()
    }

    /// Servers currently producing events for a CQ
    pub fn active_servers(&self, cq_name: &str) -> Vec<ServerAddress> {
        let state = self.lock();
        let mut servers: Vec<ServerAddress> = state
            .streams
            .values()
            .filter(|s| s.cq_name == cq_name && s.active)
            .map(|s| s.server.clone())
            .collect();
        servers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        servers
    }

    /// Servers holding a standby stream that has never been resumed
    pub fn standby_servers(&self, cq_name: &str) -> Vec<ServerAddress> {
        let state = self.lock();
        let mut servers: Vec<ServerAddress> = state
            .streams
            .values()
            .filter(|s| s.cq_name == cq_name && s.role == StreamRole::Standby && !s.active)
            .map(|s| s.server.clone())
            .collect();
        servers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        servers
    }

    pub fn is_registered(&self, address: impl Into<ServerAddress>, cq_name: &str) -> bool {
        let address = address.into();
        self.lock()
            .streams
            .values()
            .any(|s| s.server == address && s.cq_name == cq_name && s.registered)
    }

    /// Streams ever opened on a server
    pub fn streams_opened(&self, address: impl Into<ServerAddress>) -> usize {
        self.lock()
            .server(&address.into())
            .map(|s| s.opened)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EndpointDiscovery for InMemoryGrid {
    async fn candidates(&self, _region: &str) -> Result<Vec<ServerAddress>> {
        Ok(self
            .lock()
            .servers
            .iter()
            .filter(|s| s.alive)
            .map(|s| s.address.clone())
            .collect())
    }
}

#[async_trait]
impl ServerConnector for InMemoryGrid {
    async fn open_stream(
        &self,
        address: &ServerAddress,
        request: &StreamRequest,
    ) -> Result<ServerStream> {
        let delay = self.lock().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let dispatcher = ChannelChangeDispatcher::new(STREAM_CAPACITY);
        let receiver = dispatcher.create_receiver().await?;
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1;

        let mut state = self.lock();
        let server = state
            .server_mut(address)
            .ok_or_else(|| anyhow!("unknown server {address}"))?;
        if !server.alive {
            return Err(anyhow!("server {address} is down"));
        }
        if server.refuse_streams {
            return Err(anyhow!("server {address} refused the stream"));
        }
        server.opened += 1;
        let connection = ServerConnectionRef::new(id, address.clone(), &server.liveness);

        let active = request.role == StreamRole::Primary;
        let stream = StreamEntry {
            cq_name: request.cq_name.clone(),
            server: address.clone(),
            dispatcher,
            role: request.role,
            active,
            registered: true,
        };
        let snapshot = active && request.with_initial_results;
        let (initial_results, snapshot_sequence) = if snapshot {
            // Live events start after the snapshot instead of replaying the log
            let log = state.logs.get(&request.cq_name);
            let results = log
                .map(|log| {
                    log.current
                        .iter()
                        .map(|(key, value)| InitialResult {
                            key: key.clone(),
                            value: value.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            (results, Some(log.map(|log| log.last_sequence).unwrap_or(0)))
        } else {
            if active {
                state.replay(&stream, request.resume_from.unwrap_or(0));
            }
            (Vec::new(), None)
        };

        state.streams.insert(id, stream);
        debug!(
            "Grid: opened {:?} stream {id} for '{}' on {address}",
            request.role, request.cq_name
        );

        Ok(ServerStream {
            connection,
            control: Arc::new(GridStreamControl {
                grid: self.clone(),
                stream_id: id,
            }),
            receiver,
            initial_results,
            snapshot_sequence,
        })
    }
}

struct GridStreamControl {
    grid: InMemoryGrid,
    stream_id: u64,
}

#[async_trait]
impl StreamControl for GridStreamControl {
    async fn ensure_registered(&self, _predicate: &str) -> Result<bool> {
        let mut state = self.grid.lock();
        let stream = state
            .streams
            .get_mut(&self.stream_id)
            .ok_or_else(|| anyhow!("stream {} is gone", self.stream_id))?;
        if stream.registered {
            return Ok(false);
        }
        stream.registered = true;
        Ok(true)
    }

    async fn resume_from(&self, last_delivered: u64) -> Result<()> {
        let delay = self.grid.lock().resume_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.grid.lock();
        let stream = state
            .streams
            .get_mut(&self.stream_id)
            .ok_or_else(|| anyhow!("stream {} is gone", self.stream_id))?;
        stream.active = true;

        let state = &*state;
        if let Some(stream) = state.streams.get(&self.stream_id) {
            state.replay(stream, last_delivered);
        }
        Ok(())
    }

    async fn release(&self) {
        self.grid.lock().streams.remove(&self.stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChangeReceiver;

    fn request(
        cq_name: &str,
        role: StreamRole,
        resume_from: u64,
        with_initial_results: bool,
    ) -> StreamRequest {
        StreamRequest {
            cq_name: cq_name.to_string(),
            predicate: "SELECT * FROM /Portfolios".to_string(),
            region: "Portfolios".to_string(),
            resume_from: Some(resume_from),
            role,
            is_durable: false,
            with_initial_results,
        }
    }

    #[tokio::test]
    async fn test_primary_replays_after_resume_point() {
        let grid = InMemoryGrid::with_servers(1);
        grid.publish_creates("MyCq", 3);

        let mut stream = grid
            .open_stream(&"server-1".into(), &request("MyCq", StreamRole::Primary, 1, false))
            .await
            .unwrap();
        assert!(stream.initial_results.is_empty());
        assert_eq!(stream.receiver.recv().await.unwrap().sequence_id, 2);
        assert_eq!(stream.receiver.recv().await.unwrap().sequence_id, 3);
    }

    #[tokio::test]
    async fn test_initial_results_replace_replay() {
        let grid = InMemoryGrid::with_servers(1);
        grid.publish_creates("MyCq", 3);
        grid.publish("MyCq", "key-0", CqOperation::Destroy, None);

        let mut stream = grid
            .open_stream(&"server-1".into(), &request("MyCq", StreamRole::Primary, 0, true))
            .await
            .unwrap();
        let keys: Vec<&str> = stream.initial_results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["key-1", "key-2"]);
        assert_eq!(stream.snapshot_sequence, Some(4));

        grid.publish_creates("MyCq", 1);
        assert_eq!(stream.receiver.recv().await.unwrap().sequence_id, 5);
    }

    #[tokio::test]
    async fn test_standby_silent_until_resumed() {
        let grid = InMemoryGrid::with_servers(2);
        let mut standby = grid
            .open_stream(&"server-2".into(), &request("MyCq", StreamRole::Standby, 0, false))
            .await
            .unwrap();
        grid.publish_creates("MyCq", 2);
        assert_eq!(grid.standby_servers("MyCq"), vec![ServerAddress::new("server-2")]);

        standby.control.resume_from(1).await.unwrap();
        assert_eq!(standby.receiver.recv().await.unwrap().sequence_id, 2);
        assert_eq!(grid.active_servers("MyCq"), vec![ServerAddress::new("server-2")]);
    }

    #[tokio::test]
    async fn test_kill_server_disconnects_streams() {
        let grid = InMemoryGrid::with_servers(1);
        let mut stream = grid
            .open_stream(&"server-1".into(), &request("MyCq", StreamRole::Primary, 0, false))
            .await
            .unwrap();
        grid.publish_creates("MyCq", 1);
        grid.kill_server("server-1");

        assert!(!stream.connection.is_alive());
        assert_eq!(stream.receiver.recv().await.unwrap().sequence_id, 1);
        assert!(stream.receiver.recv().await.is_err());
        assert!(grid.candidates("Portfolios").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_does_not_revive_old_connections() {
        let grid = InMemoryGrid::with_servers(1);
        let stream = grid
            .open_stream(&"server-1".into(), &request("MyCq", StreamRole::Primary, 0, false))
            .await
            .unwrap();
        grid.kill_server("server-1");
        grid.restart_server("server-1");

        assert!(!stream.connection.is_alive());
        assert_eq!(grid.candidates("Portfolios").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_skipped_sequence_is_never_sent() {
        let grid = InMemoryGrid::with_servers(1);
        let mut stream = grid
            .open_stream(&"server-1".into(), &request("MyCq", StreamRole::Primary, 0, false))
            .await
            .unwrap();
        grid.publish_creates("MyCq", 1);
        assert_eq!(grid.skip_sequence("MyCq"), 2);
        grid.publish_creates("MyCq", 1);

        assert_eq!(stream.receiver.recv().await.unwrap().sequence_id, 1);
        assert_eq!(stream.receiver.recv().await.unwrap().sequence_id, 3);
    }

    #[tokio::test]
    async fn test_ensure_registered_reports_new_registration() {
        let grid = InMemoryGrid::with_servers(1);
        let stream = grid
            .open_stream(&"server-1".into(), &request("MyCq", StreamRole::Standby, 0, false))
            .await
            .unwrap();
        assert!(!stream.control.ensure_registered("p").await.unwrap());

        grid.drop_registration("server-1", "MyCq");
        assert!(!grid.is_registered("server-1", "MyCq"));
        assert!(stream.control.ensure_registered("p").await.unwrap());
        assert!(grid.is_registered("server-1", "MyCq"));
    }
}
