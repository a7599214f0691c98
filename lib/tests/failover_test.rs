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

//! # Failover Integration Tests
//!
//! Drive registered CQs against an in-memory grid, kill servers mid-stream
//! and check that listeners see every matching mutation exactly once and in
//! order across promotions.
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test failover_test -- --nocapture
//! ```

use std::sync::Arc;
use std::time::Duration;

use gridcq_lib::test_support::{
    grid_registry, test_config, wait_for_primary, wait_for_secondaries, InMemoryGrid,
    RecordingListener, RecordingSink,
};
use gridcq_lib::{CqAttributes, CqOperation, CqState, DiagnosticKind};

const WAIT: Duration = Duration::from_secs(10);
const PREDICATE: &str = "SELECT * FROM /Portfolios p WHERE p.ID != 1";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn attributes(listener: &Arc<RecordingListener>) -> Arc<CqAttributes> {
    CqAttributes::builder(PREDICATE)
        .listener(listener.handle("MyCqListener"))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_primary_failover_delivers_each_event_once() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let sink = RecordingSink::new();
    let registry = grid_registry(&grid, test_config(1), Some(sink.clone()));
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    assert_eq!(
        cq.primary_server().await.unwrap().address().as_str(),
        "server-1"
    );
    assert!(wait_for_secondaries(&cq, &["server-2"], WAIT).await);

    let last = grid.publish_creates("MyCq", 2000);
    assert_eq!(last, 2000);
    assert!(listener.wait_for_events(2000, WAIT).await);
    assert_eq!(cq.last_delivered_sequence_id(), 2000);

    grid.kill_server("server-1");
    assert!(wait_for_primary(&cq, "server-2", WAIT).await);

    grid.publish(
        "MyCq",
        "key-2000",
        CqOperation::Create,
        Some(serde_json::json!({ "ID": 2000 })),
    );
    assert!(listener.wait_for_events(2001, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(listener.event_count(), 2001);
    assert_eq!(listener.sequence_ids(), (1..=2001).collect::<Vec<u64>>());
    assert!(listener.errors().is_empty());
    assert_eq!(cq.state().await, CqState::Running);

    let stats = cq.statistics();
    assert_eq!(stats.events_before_failover, 2000);
    assert_eq!(stats.events_after_failover, 1);
    assert_eq!(stats.failovers, 1);
    assert_eq!(
        sink.promotions(),
        vec![("server-1".to_string(), "server-2".to_string())]
    );

    cq.close().await.unwrap();
    assert_eq!(listener.close_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_published_during_failover_are_not_lost() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let registry = grid_registry(&grid, test_config(1), None);
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();

    grid.publish_creates("MyCq", 300);
    grid.kill_server("server-1");
    // Published while no primary is forwarding; replayed on resume
    grid.publish_creates("MyCq", 300);

    assert!(wait_for_primary(&cq, "server-2", WAIT).await);
    assert!(listener.wait_for_events(600, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(listener.sequence_ids(), (1..=600).collect::<Vec<u64>>());
    assert!(listener.gap_errors().is_empty());
}

#[tokio::test]
async fn test_earliest_standby_is_promoted() {
    init_logging();
    let grid = InMemoryGrid::with_servers(3);
    let registry = grid_registry(&grid, test_config(2), None);
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    assert!(wait_for_secondaries(&cq, &["server-2", "server-3"], WAIT).await);

    grid.kill_server("server-1");

    assert!(wait_for_primary(&cq, "server-2", WAIT).await);
    assert!(wait_for_secondaries(&cq, &["server-3"], WAIT).await);
}

#[tokio::test]
async fn test_dead_standby_is_skipped_during_promotion() {
    init_logging();
    let grid = InMemoryGrid::with_servers(3);
    let sink = RecordingSink::new();
    let registry = grid_registry(&grid, test_config(2), Some(sink.clone()));
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    grid.publish_creates("MyCq", 10);
    assert!(listener.wait_for_events(10, WAIT).await);

    grid.kill_server("server-1");
    grid.kill_server("server-2");

    assert!(wait_for_primary(&cq, "server-3", WAIT).await);
    assert!(cq.secondary_servers().await.is_empty());
    assert!(sink
        .promotions()
        .iter()
        .all(|(_, to)| to == "server-3"));

    grid.publish_creates("MyCq", 5);
    assert!(listener.wait_for_events(15, WAIT).await);
    assert_eq!(listener.sequence_ids(), (1..=15).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_promotion_reregisters_predicate() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let registry = grid_registry(&grid, test_config(1), None);
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    grid.drop_registration("server-2", "MyCq");
    assert!(!grid.is_registered("server-2", "MyCq"));

    grid.kill_server("server-1");
    assert!(wait_for_primary(&cq, "server-2", WAIT).await);
    assert!(grid.is_registered("server-2", "MyCq"));
}

#[tokio::test]
async fn test_replacement_standby_after_promotion() {
    init_logging();
    let grid = InMemoryGrid::with_servers(3);
    let sink = RecordingSink::new();
    let registry = grid_registry(&grid, test_config(1), Some(sink.clone()));
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    assert!(wait_for_secondaries(&cq, &["server-2"], WAIT).await);
    assert_eq!(grid.streams_opened("server-3"), 0);

    grid.kill_server("server-1");
    assert!(wait_for_primary(&cq, "server-2", WAIT).await);
    assert!(wait_for_secondaries(&cq, &["server-3"], WAIT).await);
    assert_eq!(
        sink.count(|k| matches!(k, DiagnosticKind::StandbyAdded { address } if address == "server-3")),
        1
    );

    // The replacement is a real standby: it takes over on the next loss
    grid.publish_creates("MyCq", 3);
    assert!(listener.wait_for_events(3, WAIT).await);
    grid.kill_server("server-2");
    assert!(wait_for_primary(&cq, "server-3", WAIT).await);

    grid.publish_creates("MyCq", 2);
    assert!(listener.wait_for_events(5, WAIT).await);
    assert_eq!(listener.sequence_ids(), vec![1, 2, 3, 4, 5]);
    assert_eq!(cq.statistics().failovers, 2);
}

#[tokio::test]
async fn test_lost_standby_is_replaced() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let sink = RecordingSink::new();
    let registry = grid_registry(&grid, test_config(1), Some(sink.clone()));
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    assert!(wait_for_secondaries(&cq, &["server-2"], WAIT).await);

    grid.add_server("server-3");
    grid.kill_server("server-2");

    assert!(wait_for_secondaries(&cq, &["server-3"], WAIT).await);
    assert!(wait_for_primary(&cq, "server-1", WAIT).await);
    assert_eq!(
        sink.count(|k| matches!(k, DiagnosticKind::StandbyLost { .. })),
        1
    );
    assert_eq!(cq.statistics().failovers, 0);
}

#[tokio::test]
async fn test_external_primary_lost_signal() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let registry = grid_registry(&grid, test_config(1), None);
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    grid.publish_creates("MyCq", 5);
    assert!(listener.wait_for_events(5, WAIT).await);

    let primary_id = cq.primary_server().await.unwrap().id();
    let outcome = cq.on_primary_lost(primary_id).await.unwrap().unwrap();
    assert_eq!(outcome.promoted.address().as_str(), "server-2");
    assert_eq!(outcome.retired.address().as_str(), "server-1");
    assert_eq!(outcome.resumed_from, 5);

    grid.publish_creates("MyCq", 5);
    assert!(listener.wait_for_events(10, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.sequence_ids(), (1..=10).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_primary_lost_signal_keeps_new_primary() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let sink = RecordingSink::new();
    let registry = grid_registry(&grid, test_config(1), Some(sink.clone()));
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    assert!(wait_for_secondaries(&cq, &["server-2"], WAIT).await);
    grid.publish_creates("MyCq", 5);
    assert!(listener.wait_for_events(5, WAIT).await);

    let lost_id = cq.primary_server().await.unwrap().id();
    grid.kill_server("server-1");
    assert!(wait_for_primary(&cq, "server-2", WAIT).await);

    // The monitor reports the same loss after the supervisor handled it, twice
    assert!(cq.on_primary_lost(lost_id).await.unwrap().is_none());
    assert!(cq.on_primary_lost(lost_id).await.unwrap().is_none());

    assert_eq!(
        cq.primary_server().await.unwrap().address().as_str(),
        "server-2"
    );
    assert!(!cq.is_degraded().await);
    assert!(listener.errors().is_empty());
    assert_eq!(cq.statistics().failovers, 1);
    assert_eq!(
        sink.count(|k| matches!(k, DiagnosticKind::FailoverExhausted)),
        0
    );

    grid.publish_creates("MyCq", 1);
    assert!(listener.wait_for_events(6, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.sequence_ids(), (1..=6).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_primary_lost_signal_for_standby_is_ignored() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let registry = grid_registry(&grid, test_config(1), None);
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    assert!(wait_for_secondaries(&cq, &["server-2"], WAIT).await);

    let standby_id = cq.secondary_servers().await[0].id();
    assert!(cq.on_primary_lost(standby_id).await.unwrap().is_none());

    assert_eq!(
        cq.primary_server().await.unwrap().address().as_str(),
        "server-1"
    );
    assert_eq!(cq.secondary_servers().await.len(), 1);
    assert_eq!(cq.statistics().failovers, 0);
}

#[tokio::test]
async fn test_lifecycle_history_records_promotion() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let registry = grid_registry(&grid, test_config(1), None);
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    grid.kill_server("server-1");
    assert!(wait_for_primary(&cq, "server-2", WAIT).await);

    let kinds: Vec<_> = registry
        .events("MyCq")
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&gridcq_lib::LifecycleKind::Promoted));
}
