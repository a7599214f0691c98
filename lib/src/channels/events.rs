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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trait for types that carry a per-CQ sequence id, required for queue ordering
pub trait Sequenced {
    fn sequence_id(&self) -> u64;
}

/// Kind of mutation that produced a CQ event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CqOperation {
    Create,
    Update,
    Destroy,
    Invalidate,
}

/// One notification produced by the grid for a continuous query.
///
/// `sequence_id` is assigned by the server per CQ, starting at 1, and is the
/// only field the delivery pipeline relies on for ordering and de-duplication.
/// A server-reported error travels the same path as data changes and is
/// routed to the listener's `on_error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CqEvent {
    pub cq_name: String,
    pub sequence_id: u64,
    pub region_key: String,
    pub value_before: Option<serde_json::Value>,
    pub value_after: Option<serde_json::Value>,
    pub operation: CqOperation,
    /// Set when the server reports an error for this CQ instead of a change.
    pub server_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CqEvent {
    pub fn change(
        cq_name: impl Into<String>,
        sequence_id: u64,
        region_key: impl Into<String>,
        operation: CqOperation,
        value_before: Option<serde_json::Value>,
        value_after: Option<serde_json::Value>,
    ) -> Self {
        Self {
            cq_name: cq_name.into(),
            sequence_id,
            region_key: region_key.into(),
            value_before,
            value_after,
            operation,
            server_error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn server_error(
        cq_name: impl Into<String>,
        sequence_id: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            cq_name: cq_name.into(),
            sequence_id,
            region_key: String::new(),
            value_before: None,
            value_after: None,
            operation: CqOperation::Invalidate,
            server_error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.server_error.is_some()
    }
}

impl Sequenced for CqEvent {
    fn sequence_id(&self) -> u64 {
        self.sequence_id
    }
}

/// Lifecycle state of a continuous query
///
/// ```text
/// Stopped → Running → Stopped
///              ↓
///           Closed   (also reachable from Stopped; terminal)
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CqState {
    Stopped,
    Running,
    Closed,
}

impl fmt::Display for CqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqState::Stopped => write!(f, "stopped"),
            CqState::Running => write!(f, "running"),
            CqState::Closed => write!(f, "closed"),
        }
    }
}

/// What happened to a CQ, as recorded in its lifecycle history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleKind {
    Registered,
    Started,
    Stopped,
    Closed,
    Promoted,
    Degraded,
    StandbyAdded,
    StandbyLost,
    Error,
}

/// Lifecycle event emitted by queries, channels and the failover coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CqLifecycleEvent {
    pub cq_name: String,
    pub kind: LifecycleKind,
    pub state: CqState,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}

impl CqLifecycleEvent {
    pub fn new(
        cq_name: impl Into<String>,
        kind: LifecycleKind,
        state: CqState,
        message: Option<String>,
    ) -> Self {
        Self {
            cq_name: cq_name.into(),
            kind,
            state,
            timestamp: Utc::now(),
            message,
        }
    }
}
