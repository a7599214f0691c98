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

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::{broadcast, RwLock};

use crate::channels::{CqLifecycleEvent, CqState, LifecycleKind};
use crate::config::CqClientConfig;
use crate::context::CqRuntimeContext;
use crate::error::{CqError, Result};
use crate::managers::{
    log_cq_error, DiagnosticKind, DiagnosticRecord, LifecycleRecorder, LogSink, ObservabilitySink,
};
use crate::state_guard::StateGuard;
use crate::subscription::FailoverCoordinator;
use crate::transport::{EndpointDiscovery, ServerConnector, StaticDiscovery};

use super::attributes::CqAttributes;
use super::cq_query::{CqQuery, QueryMap};
use super::statistics::{CqServiceCounters, CqServiceStatistics};

/// Owns every CQ of one client cache, keyed by unique name
pub struct QueryRegistry {
    queries: QueryMap,
    context: CqRuntimeContext,
    state_guard: StateGuard,
}

impl QueryRegistry {
    pub fn builder() -> QueryRegistryBuilder {
        QueryRegistryBuilder::default()
    }

    pub fn config(&self) -> &CqClientConfig {
        &self.context.config
    }

    /// Create a CQ in the `Stopped` state.
    ///
    /// # Errors
    ///
    /// - `CqError::RegistryClosed` after `close_all` has begun
    /// - `CqError::DuplicateName` if `name` is taken
    /// - `CqError::InvalidConfig` for an empty name or a predicate without a region
    pub async fn register(
        &self,
        name: impl Into<String>,
        attributes: Arc<CqAttributes>,
    ) -> Result<Arc<CqQuery>> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CqError::invalid_config("CQ name must not be empty"));
        }
        let region = attributes.region().ok_or_else(|| {
            CqError::invalid_config(format!(
                "CQ '{name}' names no region: '{}'",
                attributes.predicate()
            ))
        })?;

        let query = {
            // Checked under the map lock so close_all either sees this entry or we see it closed
            let mut queries = self.queries.write().await;
            self.state_guard.require_open().await?;
            if queries.contains_key(&name) {
                return Err(CqError::duplicate_name(name));
            }
            let query = Arc::new(CqQuery::new(
                name.clone(),
                region.clone(),
                attributes,
                self.context.clone(),
                &self.queries,
            ));
            queries.insert(name.clone(), query.clone());
            query
        };

        self.context.counters.record_created();
        info!("Registered CQ '{name}' on region '{region}'");
        self.context
            .lifecycle
            .emit(&name, LifecycleKind::Registered, CqState::Stopped, None)
            .await;
        Ok(query)
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<CqQuery>> {
        self.queries.read().await.get(name).cloned()
    }

    /// Like `lookup`, failing with `CqError::NotFound`
    pub async fn get(&self, name: &str) -> Result<Arc<CqQuery>> {
        self.lookup(name)
            .await
            .ok_or_else(|| CqError::not_found(name))
    }

    /// Close the CQ and drop it from the registry. Unknown names are ignored.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let Some(query) = self.lookup(name).await else {
            return Ok(());
        };
        query.close().await
    }

    /// Shut the registry down: reject further registrations and close every CQ
    pub async fn close_all(&self) -> Result<()> {
        if self.state_guard.mark_closed().await {
            info!("Closing query registry");
        }

        let snapshot: Vec<Arc<CqQuery>> = {
            let queries = self.queries.read().await;
            queries.values().cloned().collect()
        };

        let mut failed = Vec::new();
        for query in snapshot {
            if let Err(e) = query.close().await {
                log_cq_error(query.name(), &format!("close failed: {e}"));
                self.record_registry_error(query.name(), &e);
                failed.push(format!("{}: {e}", query.name()));
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(CqError::Internal(anyhow::anyhow!(
                "Failed to close some CQs: {}",
                failed.join(", ")
            )))
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state_guard.is_closed().await
    }

    /// Names and states of all registered CQs, sorted by name
    pub async fn list(&self) -> Vec<(String, CqState)> {
        let snapshot: Vec<Arc<CqQuery>> = {
            let queries = self.queries.read().await;
            queries.values().cloned().collect()
        };

        let mut result = Vec::with_capacity(snapshot.len());
        for query in snapshot {
            result.push((query.name().to_string(), query.state().await));
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    pub async fn cqs_for_region(&self, region: &str) -> Vec<Arc<CqQuery>> {
        let queries = self.queries.read().await;
        let mut matching: Vec<Arc<CqQuery>> = queries
            .values()
            .filter(|query| query.region() == region)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name().cmp(b.name()));
        matching
    }

    /// Start every stopped CQ. Keeps going past failures and reports them together.
    pub async fn execute_all(&self) -> Result<()> {
        let mut failed = Vec::new();
        for query in self.snapshot_sorted().await {
            if query.state().await != CqState::Stopped {
                continue;
            }
            info!("Starting CQ '{}'", query.name());
            if let Err(e) = query.start().await {
                error!("Failed to start CQ '{}': {e}", query.name());
                failed.push(format!("{}: {e}", query.name()));
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(CqError::Internal(anyhow::anyhow!(
                "Failed to start some CQs: {}",
                failed.join(", ")
            )))
        }
    }

    pub async fn stop_all(&self) -> Result<()> {
        for query in self.snapshot_sorted().await {
            if let Err(e) = query.stop().await {
                log_cq_error(query.name(), &e.to_string());
            }
        }
        Ok(())
    }

    pub async fn service_statistics(&self) -> CqServiceStatistics {
        let snapshot = self.snapshot_sorted().await;

        let mut stats = CqServiceStatistics {
            num_cqs_created: self.context.counters.created(),
            num_cqs_closed: self.context.counters.closed(),
            num_cqs_on_client: snapshot.len() as u64,
            ..Default::default()
        };
        for query in snapshot {
            match query.state().await {
                CqState::Running => stats.num_cqs_active += 1,
                CqState::Stopped => stats.num_cqs_stopped += 1,
                CqState::Closed => {}
            }
        }
        stats
    }

    /// Lifecycle history of a CQ, oldest first. Kept after the CQ is closed.
    pub async fn events(&self, name: &str) -> Vec<CqLifecycleEvent> {
        self.context.lifecycle.events(name).await
    }

    /// Message of the most recent lifecycle error recorded for a CQ
    pub async fn last_error(&self, name: &str) -> Option<String> {
        self.context.lifecycle.last_error(name).await
    }

    pub async fn all_events(&self) -> Vec<CqLifecycleEvent> {
        self.context.lifecycle.all_events().await
    }

    /// History plus a live feed of lifecycle events for a registered CQ
    pub async fn subscribe_events(
        &self,
        name: &str,
    ) -> Option<(Vec<CqLifecycleEvent>, broadcast::Receiver<CqLifecycleEvent>)> {
        {
            let queries = self.queries.read().await;
            if !queries.contains_key(name) {
                return None;
            }
        }
        Some(self.context.lifecycle.subscribe(name).await)
    }

    async fn snapshot_sorted(&self) -> Vec<Arc<CqQuery>> {
        let queries = self.queries.read().await;
        let mut snapshot: Vec<Arc<CqQuery>> = queries.values().cloned().collect();
        snapshot.sort_by(|a, b| a.name().cmp(b.name()));
        snapshot
    }

    fn record_registry_error(&self, name: &str, error: &CqError) {
        self.context.sink.record(DiagnosticRecord::new(
            name,
            DiagnosticKind::RegistryError {
                message: error.to_string(),
            },
        ));
    }
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("context", &self.context)
            .finish()
    }
}

/// Builder for [`QueryRegistry`]
///
/// A connector is required. Discovery defaults to the config's static
/// endpoints and the sink to [`LogSink`].
#[derive(Default)]
pub struct QueryRegistryBuilder {
    config: Option<CqClientConfig>,
    discovery: Option<Arc<dyn EndpointDiscovery>>,
    connector: Option<Arc<dyn ServerConnector>>,
    sink: Option<Arc<dyn ObservabilitySink>>,
}

impl QueryRegistryBuilder {
    pub fn with_config(mut self, config: CqClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn EndpointDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn ServerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<QueryRegistry> {
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(|e| CqError::invalid_config(e.to_string()))?;

        let connector = self
            .connector
            .ok_or_else(|| CqError::invalid_config("a server connector is required"))?;
        let discovery = match self.discovery {
            Some(discovery) => discovery,
            None => {
                if config.static_endpoints.is_empty() {
                    warn!("No discovery configured and no static endpoints; every start will fail");
                }
                Arc::new(StaticDiscovery::from_config(&config))
            }
        };

        let context = CqRuntimeContext {
            lifecycle: LifecycleRecorder::new(config.event_history_capacity),
            config: Arc::new(config),
            discovery,
            connector,
            coordinator: Arc::new(FailoverCoordinator::new()),
            sink: self.sink.unwrap_or_else(|| Arc::new(LogSink)),
            counters: Arc::new(CqServiceCounters::default()),
        };

        Ok(QueryRegistry {
            queries: Arc::new(RwLock::new(HashMap::new())),
            context,
            state_guard: StateGuard::new(),
        })
    }
}
