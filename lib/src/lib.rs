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

//! Client-side continuous query (CQ) engine for a distributed data grid.
//!
//! A [`QueryRegistry`] owns named [`CqQuery`] instances. A running query
//! keeps one primary stream and optional standby streams to grid servers;
//! when the primary is lost a standby is promoted and resumes after the last
//! sequence id the listeners saw, so every matching mutation is delivered
//! exactly once and in order.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gridcq_lib::{CqAttributes, ListenerHandle, QueryRegistry};
//!
//! let registry = QueryRegistry::builder()
//!     .with_config(config)
//!     .with_connector(connector)
//!     .build()?;
//!
//! let attributes = CqAttributes::builder("SELECT * FROM /Portfolios WHERE ID != 1")
//!     .listener(ListenerHandle::from_fn("print", |event| println!("{event:?}")))
//!     .build();
//! let cq = registry.register("MyCq", attributes).await?;
//! cq.start().await?;
//! ```

// ============================================================================
// Core Public Modules
// ============================================================================

/// Error types for CQ operations
pub mod error;

/// Client configuration
pub mod config;

/// Registry, queries, attributes and listeners
pub mod queries;

/// Transport and discovery collaborator traits
pub mod transport;

// ============================================================================
// Internal Modules (visible to integration tests)
// ============================================================================

#[cfg_attr(not(test), doc(hidden))]
pub mod channels;
#[cfg_attr(not(test), doc(hidden))]
pub mod context;
#[cfg_attr(not(test), doc(hidden))]
pub mod dispatch;
#[cfg_attr(not(test), doc(hidden))]
pub mod managers;
#[cfg_attr(not(test), doc(hidden))]
pub mod state_guard;
#[cfg_attr(not(test), doc(hidden))]
pub mod subscription;

/// In-memory grid and recording listeners for tests
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

// ============================================================================
// Clean Public API
// ============================================================================

pub use error::{CqError, Result};

pub use config::{CqClientConfig, StaticEndpointConfig};

pub use channels::{CqEvent, CqLifecycleEvent, CqOperation, CqState, LifecycleKind};

pub use queries::{
    CqAttributes, CqAttributesBuilder, CqAttributesMutator, CqListener, CqQuery,
    CqServiceStatistics, CqStatisticsSnapshot, ListenerError, ListenerHandle, QueryRegistry,
    QueryRegistryBuilder,
};

pub use managers::{DiagnosticKind, DiagnosticRecord, LogSink, ObservabilitySink};

pub use subscription::PromotionOutcome;

pub use transport::{
    EndpointDiscovery, InitialResult, ServerAddress, ServerConnectionRef, ServerConnector,
    ServerStream, StaticDiscovery, StreamControl, StreamRequest, StreamRole,
};
