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

//! Server streams feeding one CQ.
//!
//! A `SubscriptionChannel` holds at most one primary stream and an ordered
//! list of standby streams, each opened against a different candidate
//! server with the CQ's predicate already registered. Every stream has its
//! own forwarder task; only the primary's forwarder passes events on to the
//! dispatcher queue. A forwarder whose receiver fails reports the
//! disconnect to the channel's supervisor task, which runs failover for a
//! lost primary and replaces lost standbys.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::Instrument;

use crate::channels::{ChangeReceiver, CqEvent, CqState, LifecycleKind, SequenceQueue};
use crate::context::CqRuntimeContext;
use crate::dispatch::ErrorReporter;
use crate::error::{CqError, Result};
use crate::managers::{log_cq_warning, DiagnosticKind, DiagnosticRecord};
use crate::queries::{CqAttributes, CqStatistics};
use crate::transport::{
    InitialResult, ServerAddress, ServerConnectionRef, StreamControl, StreamRequest, StreamRole,
};

use super::failover::PromotionOutcome;

/// Signals delivered to the channel's supervisor task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Disconnected { connection_id: u64 },
}

/// Where a connection currently sits in the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPosition {
    Primary,
    Secondary,
    Unknown,
}

/// One opened stream and its forwarder task
pub(crate) struct StreamSlot {
    pub(crate) connection: ServerConnectionRef,
    control: Arc<dyn StreamControl>,
    forwarding: Arc<AtomicBool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl StreamSlot {
    pub(crate) fn set_forwarding(&self, forwarding: bool) {
        self.forwarding.store(forwarding, Ordering::Release);
    }

    pub(crate) fn control(&self) -> &Arc<dyn StreamControl> {
        &self.control
    }

    /// Stop forwarding, ask the transport to release the stream and wait
    /// for the forwarder to exit.
    pub(crate) async fn close(mut self, timeout: Duration) {
        self.set_forwarding(false);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.control.release().await;

        if let Some(handle) = self.task.take() {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(
                    "Forwarder for connection {} did not exit within timeout",
                    self.connection.id()
                );
            }
        }
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct ChannelState {
    primary: Option<StreamSlot>,
    /// Standbys in establishment order; the first live one is promoted next
    secondaries: Vec<StreamSlot>,
    degraded: bool,
}

/// Per-CQ inputs for building a channel
pub struct ChannelParams {
    pub cq_name: String,
    pub region: String,
    pub attributes: Arc<RwLock<Arc<CqAttributes>>>,
    pub context: CqRuntimeContext,
    pub intake: SequenceQueue<CqEvent>,
    pub reporter: ErrorReporter,
    pub last_delivered: Arc<AtomicU64>,
    pub statistics: Arc<CqStatistics>,
    pub cancel_rx: watch::Receiver<bool>,
}

pub struct SubscriptionChannel {
    cq_name: String,
    region: String,
    attributes: Arc<RwLock<Arc<CqAttributes>>>,
    context: CqRuntimeContext,
    intake: SequenceQueue<CqEvent>,
    reporter: ErrorReporter,
    last_delivered: Arc<AtomicU64>,
    statistics: Arc<CqStatistics>,
    cancel_rx: watch::Receiver<bool>,
    signal_tx: mpsc::UnboundedSender<ChannelSignal>,
    state: Mutex<ChannelState>,
}

impl SubscriptionChannel {
    pub fn new(params: ChannelParams) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            cq_name: params.cq_name,
            region: params.region,
            attributes: params.attributes,
            context: params.context,
            intake: params.intake,
            reporter: params.reporter,
            last_delivered: params.last_delivered,
            statistics: params.statistics,
            cancel_rx: params.cancel_rx,
            signal_tx,
            state: Mutex::new(ChannelState::default()),
        });
        (channel, signal_rx)
    }

    pub fn cq_name(&self) -> &str {
        &self.cq_name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn last_delivered_sequence_id(&self) -> u64 {
        self.last_delivered.load(Ordering::Acquire)
    }

    pub async fn primary(&self) -> Option<ServerConnectionRef> {
        let state = self.state.lock().await;
        state.primary.as_ref().map(|slot| slot.connection.clone())
    }

    pub async fn secondaries(&self) -> Vec<ServerConnectionRef> {
        let state = self.state.lock().await;
        state
            .secondaries
            .iter()
            .map(|slot| slot.connection.clone())
            .collect()
    }

    /// True after a primary loss with no standby left to promote
    pub async fn is_degraded(&self) -> bool {
        self.state.lock().await.degraded
    }

    pub async fn position_of(&self, connection_id: u64) -> StreamPosition {
        let state = self.state.lock().await;
        if state
            .primary
            .as_ref()
            .is_some_and(|slot| slot.connection.id() == connection_id)
        {
            StreamPosition::Primary
        } else if state
            .secondaries
            .iter()
            .any(|slot| slot.connection.id() == connection_id)
        {
            StreamPosition::Secondary
        } else {
            StreamPosition::Unknown
        }
    }

    /// Open the primary and up to `redundancy_level` standbys.
    ///
    /// Candidates are tried in discovery order; the first that accepts the
    /// stream becomes primary and the following ones become standbys. Returns
    /// the primary's initial result set when requested.
    pub async fn establish(&self, with_initial_results: bool) -> Result<Vec<InitialResult>> {
        self.ensure_not_cancelled()?;

        let candidates = self
            .context
            .discovery
            .candidates(&self.region)
            .await
            .map_err(|e| CqError::establish(&self.cq_name, format!("discovery failed: {e}")))?;
        if candidates.is_empty() {
            return Err(CqError::establish(
                &self.cq_name,
                format!("no candidate servers for region '{}'", self.region),
            ));
        }
        debug!(
            "[{}] Establishing over {} candidates for region '{}'",
            self.cq_name,
            candidates.len(),
            self.region
        );

        let resume_from = self.last_delivered_sequence_id();
        let mut primary = None;
        let mut rest = candidates.iter();
        for address in rest.by_ref() {
            match self
                .open_slot(address, StreamRole::Primary, resume_from, with_initial_results)
                .await
            {
                Ok(opened) => {
                    primary = Some(opened);
                    break;
                }
                Err(CqError::Cancelled { name }) => return Err(CqError::Cancelled { name }),
                Err(e) => self.record_open_failure(address, &e),
            }
        }

        let Some((primary, initial_results)) = primary else {
            return Err(CqError::establish(
                &self.cq_name,
                "no candidate server accepted the stream",
            ));
        };

        let wanted = self.context.config.redundancy_level;
        let remaining: Vec<ServerAddress> = rest.cloned().collect();
        let standbys = self.open_standbys(&remaining, wanted, resume_from).await;
        if standbys.len() < wanted {
            log_cq_warning(
                &self.cq_name,
                &format!(
                    "redundancy level {wanted} not satisfied; {} standby streams available",
                    standbys.len()
                ),
            );
        }

        let mut state = self.state.lock().await;
        if self.is_cancelled() {
            drop(state);
            let timeout = self.context.config.shutdown_timeout();
            primary.close(timeout).await;
            join_all(standbys.into_iter().map(|slot| slot.close(timeout))).await;
            return Err(CqError::cancelled(&self.cq_name));
        }

        info!(
            "[{}] Primary on {} with {} standby streams",
            self.cq_name,
            primary.connection.address(),
            standbys.len()
        );
        state.primary = Some(primary);
        state.secondaries.extend(standbys);
        state.degraded = false;

        Ok(initial_results)
    }

    /// Failure signal for the primary on `connection_id`; runs failover.
    /// `Ok(None)` means that connection is no longer the primary.
    pub async fn on_primary_lost(
        self: &Arc<Self>,
        connection_id: u64,
    ) -> Result<Option<PromotionOutcome>> {
        let coordinator = self.context.coordinator.clone();
        coordinator.promote(self, connection_id).await
    }

    /// Liveness signal from an external health monitor
    pub fn on_disconnected(&self, connection_id: u64) {
        let _ = self.signal_tx.send(ChannelSignal::Disconnected { connection_id });
    }

    /// Release every stream. Used by stop and close.
    pub async fn teardown(&self) {
        let slots = {
            let mut state = self.state.lock().await;
            let mut slots: Vec<StreamSlot> = state.secondaries.drain(..).collect();
            if let Some(primary) = state.primary.take() {
                slots.insert(0, primary);
            }
            slots
        };

        debug!("[{}] Releasing {} streams", self.cq_name, slots.len());
        let timeout = self.context.config.shutdown_timeout();
        join_all(slots.into_iter().map(|slot| slot.close(timeout))).await;
    }

    /// Run the supervisor that reacts to disconnect signals
    pub fn spawn_supervisor(
        self: &Arc<Self>,
        mut signal_rx: mpsc::UnboundedReceiver<ChannelSignal>,
    ) -> tokio::task::JoinHandle<()> {
        let channel = self.clone();
        let span = tracing::info_span!(
            "cq_channel_supervisor",
            cq_name = %self.cq_name,
            component_type = "channel"
        );
        tokio::spawn(
            async move {
                loop {
                    let signal = tokio::select! {
                        biased;

                        _ = channel.cancelled() => break,

                        signal = signal_rx.recv() => match signal {
                            Some(signal) => signal,
                            None => break,
                        },
                    };

                    match signal {
                        ChannelSignal::Disconnected { connection_id } => {
                            channel.handle_disconnect(connection_id).await;
                        }
                    }
                }
                debug!("[{}] Channel supervisor exiting", channel.cq_name);
            }
            .instrument(span),
        )
    }

    async fn handle_disconnect(self: &Arc<Self>, connection_id: u64) {
        match self.position_of(connection_id).await {
            StreamPosition::Primary => self.fail_over_from(connection_id).await,
            StreamPosition::Secondary => self.drop_secondary(connection_id).await,
            StreamPosition::Unknown => {
                trace!(
                    "[{}] Ignoring disconnect of retired connection {connection_id}",
                    self.cq_name
                );
            }
        }
    }

    async fn fail_over_from(self: &Arc<Self>, connection_id: u64) {
        loop {
            match self.on_primary_lost(connection_id).await {
                Ok(_) => return,
                Err(CqError::MigrationInProgress { .. }) => {
                    tokio::select! {
                        biased;
                        _ = self.cancelled() => return,
                        _ = tokio::time::sleep(self.context.config.promotion_retry_interval()) => {}
                    }
                    if self.position_of(connection_id).await != StreamPosition::Primary {
                        return;
                    }
                }
                Err(CqError::FailoverExhausted { .. }) | Err(CqError::Cancelled { .. }) => return,
                Err(e) => {
                    error!("[{}] Failover failed: {e}", self.cq_name);
                    return;
                }
            }
        }
    }

    async fn drop_secondary(self: &Arc<Self>, connection_id: u64) {
        let slot = {
            let mut state = self.state.lock().await;
            let index = state
                .secondaries
                .iter()
                .position(|slot| slot.connection.id() == connection_id);
            index.map(|i| state.secondaries.remove(i))
        };
        let Some(slot) = slot else {
            return;
        };

        let address = slot.connection.address().to_string();
        warn!("[{}] Standby on {address} disconnected", self.cq_name);
        self.context.sink.record(DiagnosticRecord::new(
            self.cq_name.as_str(),
            DiagnosticKind::StandbyLost {
                address: address.clone(),
            },
        ));
        self.context
            .lifecycle
            .emit(
                &self.cq_name,
                LifecycleKind::StandbyLost,
                CqState::Running,
                Some(address),
            )
            .await;
        slot.close(self.context.config.shutdown_timeout()).await;
        self.request_replacement_standby();
    }

    /// Top the standby list back up to the redundancy level in the background.
    /// Best effort: failures are logged and never block the caller.
    pub fn request_replacement_standby(self: &Arc<Self>) {
        if self.context.config.redundancy_level == 0 || self.is_cancelled() {
            return;
        }

        let channel = self.clone();
        let span = tracing::info_span!(
            "cq_standby_request",
            cq_name = %self.cq_name,
            component_type = "channel"
        );
        tokio::spawn(
            async move {
                channel.fill_standbys().await;
            }
            .instrument(span),
        );
    }

    async fn fill_standbys(&self) {
        let (in_use, missing) = {
            let state = self.state.lock().await;
            if state.primary.is_none() {
                return;
            }
            let in_use: Vec<ServerAddress> = state
                .primary
                .iter()
                .chain(state.secondaries.iter())
                .map(|slot| slot.connection.address().clone())
                .collect();
            let wanted = self.context.config.redundancy_level;
            (in_use, wanted.saturating_sub(state.secondaries.len()))
        };
        if missing == 0 {
            return;
        }

        let candidates = match self.context.discovery.candidates(&self.region).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("[{}] Discovery failed while replacing standby: {e}", self.cq_name);
                return;
            }
        };
        let fresh: Vec<ServerAddress> = candidates
            .into_iter()
            .filter(|address| !in_use.contains(address))
            .collect();
        if fresh.is_empty() {
            debug!("[{}] No spare candidate for a replacement standby", self.cq_name);
            return;
        }

        let opened = self
            .open_standbys(&fresh, missing, self.last_delivered_sequence_id())
            .await;

        let mut extra = Vec::new();
        let mut added = Vec::new();
        {
            let mut state = self.state.lock().await;
            let wanted = self.context.config.redundancy_level;
            for slot in opened {
                let full = state.secondaries.len() >= wanted;
                if self.is_cancelled() || state.primary.is_none() || full {
                    extra.push(slot);
                } else {
                    added.push(slot.connection.address().to_string());
                    state.secondaries.push(slot);
                }
            }
        }

        let timeout = self.context.config.shutdown_timeout();
        join_all(extra.into_iter().map(|slot| slot.close(timeout))).await;

        for address in added {
            info!("[{}] Replacement standby on {address}", self.cq_name);
            self.context.sink.record(DiagnosticRecord::new(
                self.cq_name.as_str(),
                DiagnosticKind::StandbyAdded {
                    address: address.clone(),
                },
            ));
            self.context
                .lifecycle
                .emit(
                    &self.cq_name,
                    LifecycleKind::StandbyAdded,
                    CqState::Running,
                    Some(address),
                )
                .await;
        }
    }

    // ------------------------------------------------------------------------
    // Steps used by the failover coordinator
    // ------------------------------------------------------------------------

    /// Stop accepting events from the primary, if it is still the stream on
    /// `connection_id`. Events it already handed to the dispatcher queue stay
    /// queued and are still delivered.
    pub(crate) async fn retire_primary_if(&self, connection_id: u64) -> Option<ServerConnectionRef> {
        let slot = {
            let mut state = self.state.lock().await;
            let is_lost = state
                .primary
                .as_ref()
                .is_some_and(|primary| primary.connection.id() == connection_id);
            if !is_lost {
                return None;
            }
            state.primary.take()?
        };
        slot.set_forwarding(false);
        let retired = slot.connection.clone();
        debug!(
            "[{}] Retired primary on {}",
            self.cq_name,
            retired.address()
        );
        slot.close(self.context.config.shutdown_timeout()).await;
        Some(retired)
    }

    /// Remove and return the earliest-established live standby.
    /// Dead standbys found on the way are released.
    pub(crate) async fn take_next_secondary(&self) -> Option<StreamSlot> {
        let mut dead = Vec::new();
        let next = {
            let mut state = self.state.lock().await;
            let mut next = None;
            while !state.secondaries.is_empty() {
                let slot = state.secondaries.remove(0);
                if slot.connection.is_alive() {
                    next = Some(slot);
                    break;
                }
                dead.push(slot);
            }
            next
        };

        let timeout = self.context.config.shutdown_timeout();
        for slot in dead {
            debug!(
                "[{}] Skipping dead standby on {}",
                self.cq_name,
                slot.connection.address()
            );
            slot.close(timeout).await;
        }
        next
    }

    /// Make a standby produce events after `resume_from`.
    /// Gives up with `CqError::Cancelled` as soon as the query is stopped.
    pub(crate) async fn activate(&self, slot: &StreamSlot, resume_from: u64) -> Result<()> {
        // Forward before resuming so nothing the server replays is dropped
        slot.set_forwarding(true);

        let predicate = self.attributes.read().await.predicate().to_string();
        let result = tokio::select! {
            biased;

            _ = self.cancelled() => {
                slot.set_forwarding(false);
                return Err(CqError::cancelled(&self.cq_name));
            }

            result = self.resume_stream(slot, &predicate, resume_from) => result,
        };

        if let Err(e) = result {
            slot.set_forwarding(false);
            return Err(CqError::Internal(e.context(format!(
                "failed to activate stream on {}",
                slot.connection.address()
            ))));
        }
        Ok(())
    }

    async fn resume_stream(
        &self,
        slot: &StreamSlot,
        predicate: &str,
        resume_from: u64,
    ) -> anyhow::Result<()> {
        let reregistered = slot.control().ensure_registered(predicate).await?;
        if reregistered {
            debug!(
                "[{}] Re-registered predicate on {}",
                self.cq_name,
                slot.connection.address()
            );
        }
        slot.control().resume_from(resume_from).await
    }

    /// Install a promoted stream, unless the query was cancelled meanwhile
    pub(crate) async fn install_primary(&self, slot: StreamSlot) -> Result<ServerConnectionRef> {
        let mut state = self.state.lock().await;
        if self.is_cancelled() {
            drop(state);
            slot.close(self.context.config.shutdown_timeout()).await;
            return Err(CqError::cancelled(&self.cq_name));
        }
        let connection = slot.connection.clone();
        state.primary = Some(slot);
        state.degraded = false;
        Ok(connection)
    }

    /// No standby was left: report and wait for the application to restart.
    pub(crate) async fn enter_degraded(&self, retired: &ServerConnectionRef) {
        self.state.lock().await.degraded = true;

        let reason = format!("primary on {} lost", retired.address());
        error!(
            "[{}] Failover exhausted ({reason}); awaiting reconnection",
            self.cq_name
        );

        self.context.sink.record(DiagnosticRecord::new(
            self.cq_name.as_str(),
            DiagnosticKind::FailoverExhausted,
        ));
        self.reporter
            .report(CqError::failover_exhausted(self.cq_name.as_str()));
        self.reporter
            .report(CqError::disconnected(self.cq_name.as_str(), reason.clone()));
        self.context
            .lifecycle
            .emit(
                &self.cq_name,
                LifecycleKind::Degraded,
                CqState::Running,
                Some(reason),
            )
            .await;
    }

    pub(crate) fn statistics(&self) -> &CqStatistics {
        &self.statistics
    }

    pub(crate) fn context(&self) -> &CqRuntimeContext {
        &self.context
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub(crate) fn ensure_not_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CqError::cancelled(&self.cq_name));
        }
        Ok(())
    }

    /// Resolves once stop or close has been requested
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Stream opening
    // ------------------------------------------------------------------------

    async fn open_standbys(
        &self,
        candidates: &[ServerAddress],
        wanted: usize,
        resume_from: u64,
    ) -> Vec<StreamSlot> {
        let mut opened = Vec::new();
        let mut remaining = candidates.iter();

        while opened.len() < wanted {
            let batch: Vec<&ServerAddress> =
                remaining.by_ref().take(wanted - opened.len()).collect();
            if batch.is_empty() || self.is_cancelled() {
                break;
            }

            // Opened concurrently; results come back in candidate order
            let results = join_all(
                batch
                    .iter()
                    .map(|address| self.open_slot(address, StreamRole::Standby, resume_from, false)),
            )
            .await;

            for (address, result) in batch.into_iter().zip(results) {
                match result {
                    Ok((slot, _)) => opened.push(slot),
                    Err(e) => self.record_open_failure(address, &e),
                }
            }
        }

        opened
    }

    async fn open_slot(
        &self,
        address: &ServerAddress,
        role: StreamRole,
        resume_from: u64,
        with_initial_results: bool,
    ) -> Result<(StreamSlot, Vec<InitialResult>)> {
        let request = {
            let attributes = self.attributes.read().await;
            StreamRequest {
                cq_name: self.cq_name.clone(),
                predicate: attributes.predicate().to_string(),
                region: self.region.clone(),
                resume_from: Some(resume_from),
                role,
                is_durable: attributes.is_durable(),
                with_initial_results,
            }
        };

        let timeout = self.context.config.establish_timeout();
        let stream = tokio::select! {
            biased;

            _ = self.cancelled() => return Err(CqError::cancelled(&self.cq_name)),

            opened = tokio::time::timeout(timeout, self.context.connector.open_stream(address, &request)) => {
                match opened {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        return Err(CqError::Internal(
                            e.context(format!("failed to open stream on {address}")),
                        ));
                    }
                    Err(_) => {
                        return Err(CqError::establish(
                            &self.cq_name,
                            format!("timed out opening stream on {address}"),
                        ));
                    }
                }
            }
        };

        debug!(
            "[{}] Opened {:?} stream {} on {address}",
            self.cq_name,
            role,
            stream.connection.id()
        );

        if role == StreamRole::Primary {
            if let Some(snapshot) = stream.snapshot_sequence {
                // Changes up to the snapshot are already in the initial results
                self.last_delivered.fetch_max(snapshot, Ordering::AcqRel);
            }
        }

        let slot = self.spawn_forwarder(
            stream.connection,
            stream.control,
            stream.receiver,
            role == StreamRole::Primary,
        );
        Ok((slot, stream.initial_results))
    }

    fn spawn_forwarder(
        &self,
        connection: ServerConnectionRef,
        control: Arc<dyn StreamControl>,
        mut receiver: Box<dyn ChangeReceiver<CqEvent>>,
        forwarding: bool,
    ) -> StreamSlot {
        let forwarding = Arc::new(AtomicBool::new(forwarding));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let cq_name = self.cq_name.clone();
        let connection_id = connection.id();
        let intake = self.intake.clone();
        let signal_tx = self.signal_tx.clone();
        let task_forwarding = forwarding.clone();

        let span = tracing::info_span!(
            "cq_stream_forwarder",
            cq_name = %cq_name,
            connection_id = connection_id,
            server = %connection.address(),
            component_type = "forwarder"
        );
        let task = tokio::spawn(
            async move {
                loop {
                    let received = tokio::select! {
                        biased;

                        _ = &mut shutdown_rx => break,

                        received = receiver.recv() => received,
                    };

                    let event = match received {
                        Ok(event) => event,
                        Err(e) => {
                            info!("[{cq_name}] Stream {connection_id} disconnected: {e}");
                            let _ = signal_tx.send(ChannelSignal::Disconnected { connection_id });
                            break;
                        }
                    };

                    if !task_forwarding.load(Ordering::Acquire) {
                        trace!(
                            "[{cq_name}] Dropping sequence {} from inactive stream {connection_id}",
                            event.sequence_id
                        );
                        continue;
                    }

                    tokio::select! {
                        biased;

                        _ = &mut shutdown_rx => break,

                        _ = intake.enqueue_wait(event) => {}
                    }
                }
                trace!("[{cq_name}] Forwarder for stream {connection_id} exiting");
            }
            .instrument(span),
        );

        StreamSlot {
            connection,
            control,
            forwarding,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    fn record_open_failure(&self, address: &ServerAddress, error: &CqError) {
        warn!("[{}] Could not open stream on {address}: {error}", self.cq_name);
        self.context.sink.record(DiagnosticRecord::new(
            self.cq_name.as_str(),
            DiagnosticKind::EstablishFailed {
                address: address.to_string(),
                reason: error.to_string(),
            },
        ));
    }
}
