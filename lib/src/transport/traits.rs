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

//! Interfaces to the collaborators the CQ core consumes but does not own.
//!
//! - [`EndpointDiscovery`] returns ranked candidate servers for a region.
//! - [`ServerConnector`] opens one CQ stream on one server.
//! - [`StreamControl`] drives an opened stream (re-registration, resume, release).
//!
//! The connection behind a stream is owned by the transport. The core only
//! sees a [`ServerConnectionRef`] (identity plus a liveness query) and the
//! stream's receiver. The receiver returning `Err` is the disconnect signal.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::channels::{ChangeReceiver, CqEvent};

/// Network address of a grid server, e.g. `cache-1:40404`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress(String);

impl ServerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for ServerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Non-owning handle to a transport connection.
///
/// The transport keeps the liveness flag alive for as long as the connection
/// exists; once it drops or clears the flag, `is_alive()` reports false.
#[derive(Debug, Clone)]
pub struct ServerConnectionRef {
    id: u64,
    address: ServerAddress,
    liveness: Weak<AtomicBool>,
}

impl ServerConnectionRef {
    pub fn new(id: u64, address: ServerAddress, liveness: &Arc<AtomicBool>) -> Self {
        Self {
            id,
            address,
            liveness: Arc::downgrade(liveness),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_alive(&self) -> bool {
        self.liveness
            .upgrade()
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

impl PartialEq for ServerConnectionRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServerConnectionRef {}

/// Role a stream is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamRole {
    /// Produces events immediately, starting after `resume_from`
    Primary,
    /// Registers the predicate but produces nothing until resumed
    Standby,
}

/// Parameters for opening a CQ stream on a server
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub cq_name: String,
    pub predicate: String,
    pub region: String,
    /// Last sequence id the client has consumed; the stream starts after it
    pub resume_from: Option<u64>,
    pub role: StreamRole,
    pub is_durable: bool,
    pub with_initial_results: bool,
}

/// Entry of a CQ's initial result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialResult {
    pub key: String,
    pub value: serde_json::Value,
}

/// An opened CQ stream
pub struct ServerStream {
    pub connection: ServerConnectionRef,
    pub control: Arc<dyn StreamControl>,
    pub receiver: Box<dyn ChangeReceiver<CqEvent>>,
    /// Populated only when requested on a primary stream
    pub initial_results: Vec<InitialResult>,
    /// Sequence id the initial results are current as of. The stream only
    /// carries events after it.
    pub snapshot_sequence: Option<u64>,
}

/// Ranked candidate servers for a region
#[async_trait]
pub trait EndpointDiscovery: Send + Sync {
    /// Candidates in preference order; the first becomes the primary
    async fn candidates(&self, region: &str) -> Result<Vec<ServerAddress>>;
}

/// Opens CQ streams on grid servers
#[async_trait]
pub trait ServerConnector: Send + Sync {
    /// Open a stream for `request` on `address`.
    ///
    /// May block for the connection handshake. The predicate is registered
    /// on the server before this returns.
    async fn open_stream(&self, address: &ServerAddress, request: &StreamRequest)
        -> Result<ServerStream>;
}

/// Control surface of an opened stream
#[async_trait]
pub trait StreamControl: Send + Sync {
    /// Register the predicate if the server no longer has it.
    /// Returns true when a new registration was issued.
    async fn ensure_registered(&self, predicate: &str) -> Result<bool>;

    /// Start (or restart) producing events after `last_delivered`
    async fn resume_from(&self, last_delivered: u64) -> Result<()>;

    /// Stop producing events and let the transport tear the stream down
    async fn release(&self);
}
