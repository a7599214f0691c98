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

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Statically configured candidate servers for one region
///
/// Servers are listed in rank order; the first reachable one becomes the
/// primary for a CQ over this region.
///
/// ```yaml
/// static_endpoints:
///   - region: Portfolios
///     servers: ["cache-1:40404", "cache-2:40404"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticEndpointConfig {
    pub region: String,
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Client-side continuous query configuration
///
/// Every field has a default, so an empty document is a valid configuration
/// with one standby per CQ.
///
/// # Examples
///
/// ```yaml
/// id: trading-client
/// redundancy_level: 1
/// gap_grace_interval_ms: 500
/// dispatch_queue_capacity: 10000
/// static_endpoints:
///   - region: Portfolios
///     servers: ["cache-1:40404", "cache-2:40404"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CqClientConfig {
    /// Client identifier used in log output
    #[serde(default = "default_id")]
    pub id: String,

    /// Number of standby streams held per CQ in addition to the primary
    #[serde(default = "default_redundancy_level")]
    pub redundancy_level: usize,

    /// How long the dispatcher waits for a missing sequence id before reporting a gap
    #[serde(default = "default_gap_grace_interval_ms")]
    pub gap_grace_interval_ms: u64,

    /// Bound on pending events per CQ; producers wait when it is reached
    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,

    /// Upper bound on opening one server stream
    #[serde(default = "default_establish_timeout_ms")]
    pub establish_timeout_ms: u64,

    /// Pause between promotion attempts while another migration holds the token
    #[serde(default = "default_promotion_retry_interval_ms")]
    pub promotion_retry_interval_ms: u64,

    /// Upper bound on waiting for background tasks during stop
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Lifecycle events retained per CQ
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,

    #[serde(default)]
    pub static_endpoints: Vec<StaticEndpointConfig>,
}

impl Default for CqClientConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            redundancy_level: default_redundancy_level(),
            gap_grace_interval_ms: default_gap_grace_interval_ms(),
            dispatch_queue_capacity: default_dispatch_queue_capacity(),
            establish_timeout_ms: default_establish_timeout_ms(),
            promotion_retry_interval_ms: default_promotion_retry_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            event_history_capacity: default_event_history_capacity(),
            static_endpoints: Vec::new(),
        }
    }
}

impl CqClientConfig {
    pub fn gap_grace_interval(&self) -> Duration {
        Duration::from_millis(self.gap_grace_interval_ms)
    }

    pub fn establish_timeout(&self) -> Duration {
        Duration::from_millis(self.establish_timeout_ms)
    }

    pub fn promotion_retry_interval(&self) -> Duration {
        Duration::from_millis(self.promotion_retry_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate the configuration.
    ///
    /// Rejects zero capacities and timeouts and duplicate regions or servers
    /// in the static endpoint list.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_queue_capacity == 0 {
            return Err(anyhow::anyhow!("dispatch_queue_capacity must be greater than 0"));
        }
        if self.gap_grace_interval_ms == 0 {
            return Err(anyhow::anyhow!("gap_grace_interval_ms must be greater than 0"));
        }
        if self.establish_timeout_ms == 0 {
            return Err(anyhow::anyhow!("establish_timeout_ms must be greater than 0"));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(anyhow::anyhow!("shutdown_timeout_ms must be greater than 0"));
        }
        if self.event_history_capacity == 0 {
            return Err(anyhow::anyhow!("event_history_capacity must be greater than 0"));
        }

        let mut regions = HashSet::new();
        for endpoint in &self.static_endpoints {
            if !regions.insert(&endpoint.region) {
                return Err(anyhow::anyhow!(
                    "Duplicate static endpoint region: '{}'",
                    endpoint.region
                ));
            }
            let mut servers = HashSet::new();
            for server in &endpoint.servers {
                if !servers.insert(server) {
                    return Err(anyhow::anyhow!(
                        "Region '{}' lists server '{}' more than once",
                        endpoint.region,
                        server
                    ));
                }
            }
        }

        Ok(())
    }
}

fn default_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_redundancy_level() -> usize {
    1
}

fn default_gap_grace_interval_ms() -> u64 {
    500
}

fn default_dispatch_queue_capacity() -> usize {
    10_000
}

fn default_establish_timeout_ms() -> u64 {
    5_000
}

fn default_promotion_retry_interval_ms() -> u64 {
    50
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_event_history_capacity() -> usize {
    100
}
