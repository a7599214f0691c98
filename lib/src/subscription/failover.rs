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

//! Promotion of a standby stream after the primary is lost.
//!
//! At most one promotion runs per CQ at a time. The coordinator hands out a
//! [`MigrationToken`] per CQ name; a second caller gets
//! `CqError::MigrationInProgress` and is expected to retry after the
//! configured interval, by which time the first promotion has installed a
//! new primary or declared the query degraded.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::channels::{CqState, LifecycleKind};
use crate::error::{CqError, Result};
use crate::managers::{log_promotion, DiagnosticKind, DiagnosticRecord};
use crate::transport::ServerConnectionRef;

use super::channel::SubscriptionChannel;

/// Result of a completed promotion
#[derive(Debug, Clone)]
pub struct PromotionOutcome {
    /// The primary that was reported lost and retired
    pub retired: ServerConnectionRef,
    pub promoted: ServerConnectionRef,
    /// Sequence id the promoted stream resumed after
    pub resumed_from: u64,
}

/// Serializes promotions per CQ
#[derive(Debug, Default)]
pub struct FailoverCoordinator {
    in_flight: Mutex<HashSet<String>>,
}

impl FailoverCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the migration token for `cq_name`, if nobody holds it
    pub fn try_acquire(self: &Arc<Self>, cq_name: &str) -> Option<MigrationToken> {
        if !self.lock().insert(cq_name.to_string()) {
            return None;
        }
        Some(MigrationToken {
            coordinator: self.clone(),
            cq_name: cq_name.to_string(),
        })
    }

    pub fn is_migrating(&self, cq_name: &str) -> bool {
        self.lock().contains(cq_name)
    }

    /// Replace the channel's primary with its next live standby, provided the
    /// installed primary is still the connection `lost_connection_id`.
    ///
    /// Returns `Ok(None)` when that connection is no longer the primary: the
    /// loss was already handled and a late or repeated report must not retire
    /// its healthy successor.
    ///
    /// The retired primary stops forwarding before the standby is activated,
    /// and the standby resumes after the last sequence id the dispatcher
    /// delivered, so the listener sees neither a hole nor a repeat beyond
    /// what the dispatcher already discards as duplicate.
    pub async fn promote(
        self: &Arc<Self>,
        channel: &Arc<SubscriptionChannel>,
        lost_connection_id: u64,
    ) -> Result<Option<PromotionOutcome>> {
        let cq_name = channel.cq_name().to_string();
        let Some(_token) = self.try_acquire(&cq_name) else {
            debug!("[{cq_name}] Promotion already in progress");
            return Err(CqError::migration_in_progress(cq_name));
        };
        channel.ensure_not_cancelled()?;

        // Checked under the token so no other promotion can swap the primary
        let Some(retired) = channel.retire_primary_if(lost_connection_id).await else {
            debug!(
                "[{cq_name}] Connection {lost_connection_id} is not the primary; nothing to promote"
            );
            return Ok(None);
        };

        loop {
            channel.ensure_not_cancelled()?;

            let Some(candidate) = channel.take_next_secondary().await else {
                channel.enter_degraded(&retired).await;
                return Err(CqError::failover_exhausted(cq_name));
            };

            // Read after the old primary stopped forwarding
            let resume_from = channel.last_delivered_sequence_id();
            if let Err(e) = channel.activate(&candidate, resume_from).await {
                if matches!(e, CqError::Cancelled { .. }) {
                    candidate
                        .close(channel.context().config.shutdown_timeout())
                        .await;
                    return Err(e);
                }
                warn!(
                    "[{cq_name}] Standby on {} could not be promoted: {e}",
                    candidate.connection.address()
                );
                channel
                    .context()
                    .sink
                    .record(DiagnosticRecord::new(
                        cq_name.as_str(),
                        DiagnosticKind::EstablishFailed {
                            address: candidate.connection.address().to_string(),
                            reason: e.to_string(),
                        },
                    ));
                candidate
                    .close(channel.context().config.shutdown_timeout())
                    .await;
                continue;
            }

            let promoted = channel.install_primary(candidate).await?;
            self.record_promotion(channel, &retired, &promoted, resume_from)
                .await;
            channel.request_replacement_standby();

            return Ok(Some(PromotionOutcome {
                retired,
                promoted,
                resumed_from: resume_from,
            }));
        }
    }

    async fn record_promotion(
        &self,
        channel: &SubscriptionChannel,
        retired: &ServerConnectionRef,
        promoted: &ServerConnectionRef,
        resume_from: u64,
    ) {
        let cq_name = channel.cq_name();
        let from = retired.address().to_string();
        let to = promoted.address().to_string();

        channel.statistics().record_failover();
        log_promotion(cq_name, &from, &to, resume_from);

        let context = channel.context();
        context.sink.record(DiagnosticRecord::new(
            cq_name,
            DiagnosticKind::Promotion {
                from: from.clone(),
                to: to.clone(),
                resume_from,
            },
        ));
        context
            .lifecycle
            .emit(
                cq_name,
                LifecycleKind::Promoted,
                CqState::Running,
                Some(format!("{from} -> {to}")),
            )
            .await;
    }
}

/// Held while a promotion runs; releases the CQ on drop
#[derive(Debug)]
pub struct MigrationToken {
    coordinator: Arc<FailoverCoordinator>,
    cq_name: String,
}

impl Drop for MigrationToken {
    fn drop(&mut self) {
        self.coordinator.lock().remove(&self.cq_name);
    }
}
