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

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channels::CqOperation;

/// Per-CQ counters, updated by the dispatcher and failover coordinator.
///
/// Events delivered before the first promotion count toward
/// `events_before_failover`; everything after toward `events_after_failover`.
#[derive(Debug, Default)]
pub struct CqStatistics {
    num_inserts: AtomicU64,
    num_updates: AtomicU64,
    num_deletes: AtomicU64,
    num_events: AtomicU64,
    num_errors: AtomicU64,
    events_before_failover: AtomicU64,
    events_after_failover: AtomicU64,
    duplicates_discarded: AtomicU64,
    gaps_detected: AtomicU64,
    failovers: AtomicU64,
    listener_panics: AtomicU64,
}

impl CqStatistics {
    pub fn record_event(&self, operation: CqOperation) {
        match operation {
            CqOperation::Create => &self.num_inserts,
            CqOperation::Update => &self.num_updates,
            CqOperation::Destroy | CqOperation::Invalidate => &self.num_deletes,
        }
        .fetch_add(1, Ordering::Relaxed);
        self.num_events.fetch_add(1, Ordering::Relaxed);

        if self.failovers.load(Ordering::Acquire) == 0 {
            self.events_before_failover.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events_after_failover.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self) {
        self.num_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self) {
        self.gaps_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_listener_panic(&self) {
        self.listener_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CqStatisticsSnapshot {
        CqStatisticsSnapshot {
            num_inserts: self.num_inserts.load(Ordering::Relaxed),
            num_updates: self.num_updates.load(Ordering::Relaxed),
            num_deletes: self.num_deletes.load(Ordering::Relaxed),
            num_events: self.num_events.load(Ordering::Relaxed),
            num_errors: self.num_errors.load(Ordering::Relaxed),
            events_before_failover: self.events_before_failover.load(Ordering::Relaxed),
            events_after_failover: self.events_after_failover.load(Ordering::Relaxed),
            duplicates_discarded: self.duplicates_discarded.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            listener_panics: self.listener_panics.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqStatisticsSnapshot {
    pub num_inserts: u64,
    pub num_updates: u64,
    pub num_deletes: u64,
    pub num_events: u64,
    pub num_errors: u64,
    pub events_before_failover: u64,
    pub events_after_failover: u64,
    pub duplicates_discarded: u64,
    pub gaps_detected: u64,
    pub failovers: u64,
    pub listener_panics: u64,
}

/// Registry-wide CQ counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqServiceStatistics {
    pub num_cqs_created: u64,
    pub num_cqs_active: u64,
    pub num_cqs_stopped: u64,
    pub num_cqs_closed: u64,
    pub num_cqs_on_client: u64,
}

/// Registry-wide counters that outlive individual CQs
#[derive(Debug, Default)]
pub struct CqServiceCounters {
    created: AtomicU64,
    closed: AtomicU64,
}

impl CqServiceCounters {
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_around_failover() {
        let stats = CqStatistics::default();
        stats.record_event(CqOperation::Create);
        stats.record_event(CqOperation::Update);
        stats.record_failover();
        stats.record_event(CqOperation::Destroy);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.num_events, 3);
        assert_eq!(snapshot.events_before_failover, 2);
        assert_eq!(snapshot.events_after_failover, 1);
        assert_eq!(snapshot.num_inserts, 1);
        assert_eq!(snapshot.num_updates, 1);
        assert_eq!(snapshot.num_deletes, 1);
        assert_eq!(snapshot.failovers, 1);
    }

    #[test]
    fn test_error_and_gap_counters() {
        let stats = CqStatistics::default();
        stats.record_error();
        stats.record_gap();
        stats.record_duplicate();
        stats.record_duplicate();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.num_errors, 1);
        assert_eq!(snapshot.gaps_detected, 1);
        assert_eq!(snapshot.duplicates_discarded, 2);
        assert_eq!(snapshot.num_events, 0);
    }
}
