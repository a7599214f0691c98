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

//! In-memory collaborators for exercising CQs without a real grid.

pub mod grid;
pub mod recorders;

pub use grid::InMemoryGrid;
pub use recorders::{RecordingListener, RecordingSink};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::CqClientConfig;
use crate::queries::{CqQuery, QueryRegistry};

/// Config with short timers suited to tests
pub fn test_config(redundancy_level: usize) -> CqClientConfig {
    CqClientConfig {
        id: "test-client".to_string(),
        redundancy_level,
        gap_grace_interval_ms: 100,
        establish_timeout_ms: 1_000,
        promotion_retry_interval_ms: 10,
        shutdown_timeout_ms: 1_000,
        ..Default::default()
    }
}

/// Registry wired to `grid` for both discovery and transport
pub fn grid_registry(
    grid: &InMemoryGrid,
    config: CqClientConfig,
    sink: Option<Arc<RecordingSink>>,
) -> QueryRegistry {
    let mut builder = QueryRegistry::builder()
        .with_config(config)
        .with_discovery(Arc::new(grid.clone()))
        .with_connector(Arc::new(grid.clone()));
    if let Some(sink) = sink {
        builder = builder.with_sink(sink);
    }
    match builder.build() {
        Ok(registry) => registry,
        Err(e) => panic!("test registry config rejected: {e}"),
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Wait until `cq`'s primary stream is on `address`
pub async fn wait_for_primary(
    cq: &CqQuery,
    address: &str,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let primary = cq.primary_server().await;
        if primary.is_some_and(|c| c.address().as_str() == address) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait until `cq`'s standby list is exactly `addresses`, in order
pub async fn wait_for_secondaries(
    cq: &CqQuery,
    addresses: &[&str],
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let current: Vec<String> = cq
            .secondary_servers()
            .await
            .iter()
            .map(|c| c.address().to_string())
            .collect();
        if current == addresses {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
