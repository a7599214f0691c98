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
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use tokio::sync::{watch, Mutex, RwLock};

use crate::channels::{CqState, LifecycleKind};
use crate::context::CqRuntimeContext;
use crate::dispatch::{DispatcherContext, EventDispatcher};
use crate::error::{CqError, Result};
use crate::managers::{
    log_cq_close, log_cq_error, log_cq_start, log_cq_stop, validate_operation, Operation,
    Transition,
};
use crate::subscription::{ChannelParams, PromotionOutcome, SubscriptionChannel};
use crate::transport::{InitialResult, ServerConnectionRef};

use super::attributes::CqAttributes;
use super::listener::ListenerHandle;
use super::statistics::{CqStatistics, CqStatisticsSnapshot};

pub(crate) type QueryMap = Arc<RwLock<HashMap<String, Arc<CqQuery>>>>;

/// Components that exist only while the query is running
struct CqRuntime {
    channel: Arc<SubscriptionChannel>,
    dispatcher: EventDispatcher,
    supervisor: tokio::task::JoinHandle<()>,
}

/// A registered continuous query.
///
/// Lifecycle operations (`start`, `stop`, `close`) are serialized per
/// query. `stop` and `close` first raise the query's cancellation flag so an
/// establishment or promotion in flight aborts at its next step instead of
/// holding them up.
pub struct CqQuery {
    name: String,
    region: String,
    attributes: Arc<RwLock<Arc<CqAttributes>>>,
    state: Arc<RwLock<CqState>>,
    statistics: Arc<CqStatistics>,
    last_delivered: Arc<AtomicU64>,
    runtime: Mutex<Option<CqRuntime>>,
    /// Channel of the current run, readable without waiting on lifecycle ops
    channel: RwLock<Option<Arc<SubscriptionChannel>>>,
    cancel: std::sync::Mutex<Option<watch::Sender<bool>>>,
    context: CqRuntimeContext,
    registry: Weak<RwLock<HashMap<String, Arc<CqQuery>>>>,
}

impl CqQuery {
    pub(crate) fn new(
        name: String,
        region: String,
        attributes: Arc<CqAttributes>,
        context: CqRuntimeContext,
        registry: &QueryMap,
    ) -> Self {
        Self {
            name,
            region,
            attributes: Arc::new(RwLock::new(attributes)),
            state: Arc::new(RwLock::new(CqState::Stopped)),
            statistics: Arc::new(CqStatistics::default()),
            last_delivered: Arc::new(AtomicU64::new(0)),
            runtime: Mutex::new(None),
            channel: RwLock::new(None),
            cancel: std::sync::Mutex::new(None),
            context,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region the predicate runs over
    pub fn region(&self) -> &str {
        &self.region
    }

    pub async fn predicate(&self) -> String {
        self.attributes.read().await.predicate().to_string()
    }

    /// Current attributes snapshot
    pub async fn attributes(&self) -> Arc<CqAttributes> {
        self.attributes.read().await.clone()
    }

    pub async fn is_durable(&self) -> bool {
        self.attributes.read().await.is_durable()
    }

    pub async fn state(&self) -> CqState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == CqState::Running
    }

    pub async fn is_stopped(&self) -> bool {
        self.state().await == CqState::Stopped
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await == CqState::Closed
    }

    pub fn statistics(&self) -> CqStatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Highest sequence id handed to the listeners. Kept across stop/start.
    pub fn last_delivered_sequence_id(&self) -> u64 {
        self.last_delivered.load(Ordering::Acquire)
    }

    /// True while running without any path to the grid
    pub async fn is_degraded(&self) -> bool {
        match self.current_channel().await {
            Some(channel) => channel.is_degraded().await,
            None => false,
        }
    }

    /// True while a standby is being promoted for this query
    pub fn is_failing_over(&self) -> bool {
        self.context.coordinator.is_migrating(&self.name)
    }

    pub async fn primary_server(&self) -> Option<ServerConnectionRef> {
        self.current_channel().await?.primary().await
    }

    pub async fn secondary_servers(&self) -> Vec<ServerConnectionRef> {
        match self.current_channel().await {
            Some(channel) => channel.secondaries().await,
            None => Vec::new(),
        }
    }

    async fn current_channel(&self) -> Option<Arc<SubscriptionChannel>> {
        self.channel.read().await.clone()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Subscribe on the grid and start delivering events
    pub async fn start(&self) -> Result<()> {
        self.run(false).await.map(|_| ())
    }

    /// Like `start`, returning the primary's current matches for the predicate
    pub async fn execute_with_initial_results(&self) -> Result<Vec<InitialResult>> {
        self.run(true).await
    }

    async fn run(&self, with_initial_results: bool) -> Result<Vec<InitialResult>> {
        let mut runtime = self.runtime.lock().await;

        let state = *self.state.read().await;
        validate_operation(&self.name, state, Operation::Start)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.set_cancel(Some(cancel_tx));

        let config = &self.context.config;
        let mut dispatcher = EventDispatcher::spawn(DispatcherContext {
            cq_name: self.name.clone(),
            attributes: self.attributes.clone(),
            statistics: self.statistics.clone(),
            last_delivered: self.last_delivered.clone(),
            sink: self.context.sink.clone(),
            gap_grace_interval: config.gap_grace_interval(),
            queue_capacity: config.dispatch_queue_capacity,
        });

        let (channel, signal_rx) = SubscriptionChannel::new(ChannelParams {
            cq_name: self.name.clone(),
            region: self.region.clone(),
            attributes: self.attributes.clone(),
            context: self.context.clone(),
            intake: dispatcher.intake(),
            reporter: dispatcher.error_reporter(),
            last_delivered: self.last_delivered.clone(),
            statistics: self.statistics.clone(),
            cancel_rx,
        });

        let initial_results = match channel.establish(with_initial_results).await {
            Ok(results) => results,
            Err(e) => {
                channel.teardown().await;
                dispatcher.stop(config.shutdown_timeout()).await;
                self.set_cancel(None);

                log_cq_error(&self.name, &format!("failed to start: {e}"));
                self.context
                    .lifecycle
                    .emit(&self.name, LifecycleKind::Error, state, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let supervisor = channel.spawn_supervisor(signal_rx);
        *self.channel.write().await = Some(channel.clone());
        *runtime = Some(CqRuntime {
            channel,
            dispatcher,
            supervisor,
        });
        *self.state.write().await = CqState::Running;

        let predicate = self.predicate().await;
        log_cq_start(&self.name, &predicate);
        self.context
            .lifecycle
            .emit(
                &self.name,
                LifecycleKind::Started,
                CqState::Running,
                Some(format!(
                    "resuming after sequence {}",
                    self.last_delivered_sequence_id()
                )),
            )
            .await;

        Ok(initial_results)
    }

    /// Detach from the grid without closing the listeners. Idempotent.
    ///
    /// Events queued but not yet delivered are discarded; a later `start`
    /// resumes after the last delivered sequence id.
    pub async fn stop(&self) -> Result<()> {
        self.fire_cancel();
        let mut runtime = self.runtime.lock().await;

        let state = *self.state.read().await;
        if validate_operation(&self.name, state, Operation::Stop)? == Transition::NoOp {
            debug!("[{}] Already stopped", self.name);
            return Ok(());
        }

        if let Some(active) = runtime.take() {
            self.shutdown(active).await;
        }
        *self.state.write().await = CqState::Stopped;

        log_cq_stop(&self.name);
        self.context
            .lifecycle
            .emit(&self.name, LifecycleKind::Stopped, CqState::Stopped, None)
            .await;
        Ok(())
    }

    /// Detach, close every listener once and leave the registry.
    /// Closing a closed query does nothing.
    pub async fn close(&self) -> Result<()> {
        self.fire_cancel();
        let mut runtime = self.runtime.lock().await;

        let state = *self.state.read().await;
        if validate_operation(&self.name, state, Operation::Close)? == Transition::NoOp {
            debug!("[{}] Already closed", self.name);
            return Ok(());
        }

        if let Some(active) = runtime.take() {
            self.shutdown(active).await;
        }

        // Once Closed is visible no mutator can swap the listener list
        *self.state.write().await = CqState::Closed;
        let attributes = self.attributes.read().await.clone();
        for handle in attributes.listeners() {
            let listener = handle.listener();
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener.close())).is_err() {
                error!(
                    "[{}] Listener '{}' panicked while closing",
                    self.name,
                    handle.id()
                );
                self.statistics.record_listener_panic();
            }
        }

        self.leave_registry().await;
        self.context.counters.record_closed();

        log_cq_close(&self.name);
        self.context
            .lifecycle
            .emit(&self.name, LifecycleKind::Closed, CqState::Closed, None)
            .await;
        Ok(())
    }

    /// Failure signal from an external health monitor for the primary on
    /// `connection_id`. Runs failover inline and returns its outcome, or
    /// `None` when that connection is no longer the primary.
    pub async fn on_primary_lost(&self, connection_id: u64) -> Result<Option<PromotionOutcome>> {
        match self.current_channel().await {
            Some(channel) => channel.on_primary_lost(connection_id).await,
            None => Err(CqError::disconnected(
                self.name.as_str(),
                "query is not running",
            )),
        }
    }

    /// Liveness signal for one of this query's connections
    pub async fn on_disconnected(&self, connection_id: u64) {
        if let Some(channel) = self.current_channel().await {
            channel.on_disconnected(connection_id);
        }
    }

    /// Reconfigure the listener list of this query
    pub fn attributes_mutator(&self) -> CqAttributesMutator<'_> {
        CqAttributesMutator { query: self }
    }

    async fn shutdown(&self, active: CqRuntime) {
        let CqRuntime {
            channel,
            mut dispatcher,
            supervisor,
        } = active;
        let timeout = self.context.config.shutdown_timeout();

        *self.channel.write().await = None;
        channel.teardown().await;

        let abort = supervisor.abort_handle();
        if tokio::time::timeout(timeout, supervisor).await.is_err() {
            warn!(
                "[{}] Channel supervisor did not exit within timeout; aborting",
                self.name
            );
            abort.abort();
        }
        // A promotion racing the teardown may have installed streams
        channel.teardown().await;

        let discarded = dispatcher.stop(timeout).await;
        if discarded > 0 {
            debug!("[{}] {discarded} queued events dropped", self.name);
        }
        self.set_cancel(None);
    }

    fn fire_cancel(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = cancel.as_ref() {
            tx.send_replace(true);
        }
    }

    fn set_cancel(&self, sender: Option<watch::Sender<bool>>) {
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = sender;
    }

    async fn leave_registry(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut queries = registry.write().await;
        let registered_here = queries
            .get(&self.name)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self));
        if registered_here {
            queries.remove(&self.name);
            info!("[{}] Removed from registry", self.name);
        }
    }
}

impl std::fmt::Debug for CqQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqQuery")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("last_delivered", &self.last_delivered_sequence_id())
            .finish()
    }
}

/// Installs new attribute snapshots on a query.
///
/// Every change builds a fresh [`CqAttributes`] and swaps it in, so the
/// dispatcher sees either the old or the new listener list for a delivery,
/// never a partial one. Removed listeners are not closed.
pub struct CqAttributesMutator<'a> {
    query: &'a CqQuery,
}

impl CqAttributesMutator<'_> {
    pub async fn add_listener(&self, listener: ListenerHandle) -> Result<()> {
        self.update(|listeners| {
            listeners.push(listener);
            true
        })
        .await
        .map(|_| ())
    }

    /// Returns false when no listener has this id
    pub async fn remove_listener(&self, listener_id: &str) -> Result<bool> {
        self.update(|listeners| {
            let before = listeners.len();
            listeners.retain(|handle| handle.id() != listener_id);
            listeners.len() != before
        })
        .await
    }

    pub async fn set_listeners(&self, listeners: Vec<ListenerHandle>) -> Result<()> {
        self.update(move |current| {
            *current = listeners;
            true
        })
        .await
        .map(|_| ())
    }

    async fn update<F>(&self, change: F) -> Result<bool>
    where
        F: FnOnce(&mut Vec<ListenerHandle>) -> bool,
    {
        let query = self.query;
        // Held across the swap so close() observes the final listener list
        let state = query.state.read().await;
        validate_operation(&query.name, *state, Operation::Mutate)?;

        let mut attributes = query.attributes.write().await;
        let mut listeners = attributes.listeners().to_vec();
        if !change(&mut listeners) {
            return Ok(false);
        }
        let next = attributes.with_listeners(listeners);
        *attributes = next;
        debug!(
            "[{}] Listener list now has {} entries",
            query.name,
            attributes.listeners().len()
        );
        Ok(true)
    }
}
