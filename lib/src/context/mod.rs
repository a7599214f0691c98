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

//! Runtime context shared by every CQ of one registry.
//!
//! The registry builds a single [`CqRuntimeContext`] and hands a clone to
//! each query it creates, so queries, channels and the failover coordinator
//! reach the same collaborators without any process-global state.

use std::sync::Arc;

use crate::config::CqClientConfig;
use crate::managers::{LifecycleRecorder, ObservabilitySink};
use crate::queries::CqServiceCounters;
use crate::subscription::FailoverCoordinator;
use crate::transport::{EndpointDiscovery, ServerConnector};

/// Services available to a CQ and the components acting on its behalf.
///
/// # Clone
///
/// Cloning is cheap: every field is an `Arc` or a handle over one.
#[derive(Clone)]
pub struct CqRuntimeContext {
    pub config: Arc<CqClientConfig>,
    pub discovery: Arc<dyn EndpointDiscovery>,
    pub connector: Arc<dyn ServerConnector>,
    pub coordinator: Arc<FailoverCoordinator>,
    pub sink: Arc<dyn ObservabilitySink>,
    pub lifecycle: LifecycleRecorder,
    pub counters: Arc<CqServiceCounters>,
}

impl std::fmt::Debug for CqRuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqRuntimeContext")
            .field("client_id", &self.config.id)
            .field("redundancy_level", &self.config.redundancy_level)
            .finish()
    }
}
