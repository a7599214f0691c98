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

//! # Delivery Ordering Tests
//!
//! Sequence-id ordering, gap handling and the single-consumer callback
//! discipline, exercised end to end through the in-memory grid.

use std::sync::Arc;
use std::time::Duration;

use gridcq_lib::test_support::{
    grid_registry, test_config, wait_for_primary, InMemoryGrid, RecordingListener, RecordingSink,
};
use gridcq_lib::{CqAttributes, CqClientConfig, CqEvent, CqOperation, DiagnosticKind};

const WAIT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn attributes(listener: &Arc<RecordingListener>) -> Arc<CqAttributes> {
    CqAttributes::builder("SELECT * FROM /Portfolios WHERE ID != 1")
        .listener(listener.handle("MyCqListener"))
        .build()
}

#[tokio::test]
async fn test_missing_sequence_reported_once() {
    init_logging();
    let grid = InMemoryGrid::with_servers(1);
    let sink = RecordingSink::new();
    let registry = grid_registry(&grid, test_config(0), Some(sink.clone()));
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();

    grid.publish_creates("MyCq", 3);
    let skipped = grid.skip_sequence("MyCq");
    grid.publish_creates("MyCq", 3);

    assert!(listener.wait_for_events(6, WAIT).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(skipped, 4);
    assert_eq!(listener.sequence_ids(), vec![1, 2, 3, 5, 6, 7]);
    assert_eq!(listener.gap_errors(), vec![(4, 5)]);
    assert_eq!(cq.statistics().gaps_detected, 1);
    assert_eq!(
        sink.count(|k| matches!(k, DiagnosticKind::GapDetected { .. })),
        1
    );
    assert_eq!(cq.last_delivered_sequence_id(), 7);
}

#[tokio::test]
async fn test_server_errors_delivered_in_sequence() {
    init_logging();
    let grid = InMemoryGrid::with_servers(1);
    let registry = grid_registry(&grid, test_config(0), None);
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();

    grid.publish_creates("MyCq", 2);
    grid.publish_server_error("MyCq", "query execution failed");
    grid.publish_creates("MyCq", 2);

    assert!(listener.wait_for_events(4, WAIT).await);
    assert!(listener.wait_for_errors(1, WAIT).await);
    assert_eq!(listener.sequence_ids(), vec![1, 2, 4, 5]);

    let server_errors = listener.server_errors();
    assert_eq!(server_errors.len(), 1);
    assert_eq!(server_errors[0].sequence_id, 3);
    assert_eq!(
        server_errors[0].server_error.as_deref(),
        Some("query execution failed")
    );
    assert_eq!(cq.statistics().num_errors, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callbacks_never_overlap_under_concurrent_producers() {
    init_logging();
    let grid = InMemoryGrid::with_servers(3);
    let registry = grid_registry(&grid, test_config(2), None);
    let listener = RecordingListener::with_delay(Duration::from_micros(200));

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();

    let publisher = {
        let grid = grid.clone();
        tokio::spawn(async move {
            for i in 0..400 {
                grid.publish(
                    "MyCq",
                    format!("key-{i}"),
                    CqOperation::Update,
                    Some(serde_json::json!({ "ID": i })),
                );
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    // Stale copies of already-published events, as a retired primary or a
    // standby might still send them
    let injector = {
        let grid = grid.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                let last = grid.last_sequence("MyCq");
                if last > 0 {
                    let stale =
                        CqEvent::change("MyCq", last, "stale", CqOperation::Update, None, None);
                    grid.inject("server-1", stale.clone());
                    grid.inject("server-2", stale.clone());
                    grid.inject("server-3", stale);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    grid.kill_server("server-1");

    publisher.await.unwrap();
    injector.await.unwrap();
    assert!(wait_for_primary(&cq, "server-2", WAIT).await);

    assert!(listener.wait_for_events(400, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(listener.overlaps(), 0);
    assert_eq!(listener.sequence_ids(), (1..=400).collect::<Vec<u64>>());
    assert!(listener.errors().is_empty());
}

#[tokio::test]
async fn test_slow_listener_with_small_queue_loses_nothing() {
    init_logging();
    let grid = InMemoryGrid::with_servers(1);
    let config = CqClientConfig {
        dispatch_queue_capacity: 4,
        ..test_config(0)
    };
    let registry = grid_registry(&grid, config, None);
    let listener = RecordingListener::with_delay(Duration::from_millis(1));

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();

    grid.publish_creates("MyCq", 100);
    assert!(listener.wait_for_events(100, WAIT).await);
    assert_eq!(listener.sequence_ids(), (1..=100).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_panicking_listener_keeps_query_running() {
    init_logging();
    let grid = InMemoryGrid::with_servers(1);
    let sink = RecordingSink::new();
    let registry = grid_registry(&grid, test_config(0), Some(sink.clone()));
    let faulty = RecordingListener::panicking_on(2);
    let healthy = RecordingListener::new();

    let attributes = CqAttributes::builder("SELECT * FROM /Portfolios")
        .listener(faulty.handle("faulty"))
        .listener(healthy.handle("healthy"))
        .build();
    let cq = registry.register("MyCq", attributes).await.unwrap();
    cq.start().await.unwrap();

    grid.publish_creates("MyCq", 5);
    assert!(healthy.wait_for_events(5, WAIT).await);

    assert!(cq.is_running().await);
    assert_eq!(faulty.event_count(), 5);
    assert_eq!(cq.statistics().listener_panics, 1);
    assert_eq!(
        sink.count(|k| matches!(k, DiagnosticKind::ListenerPanic { .. })),
        1
    );
}

#[tokio::test]
async fn test_restart_resumes_after_last_delivered() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let registry = grid_registry(&grid, test_config(1), None);
    let listener = RecordingListener::new();

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    cq.start().await.unwrap();
    grid.publish_creates("MyCq", 5);
    assert!(listener.wait_for_events(5, WAIT).await);

    cq.stop().await.unwrap();
    grid.publish_creates("MyCq", 5);
    cq.start().await.unwrap();

    assert!(listener.wait_for_events(10, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.sequence_ids(), (1..=10).collect::<Vec<u64>>());
    assert_eq!(cq.statistics().duplicates_discarded, 0);
}

#[tokio::test]
async fn test_execute_with_initial_results() {
    init_logging();
    let grid = InMemoryGrid::with_servers(2);
    let registry = grid_registry(&grid, test_config(1), None);
    let listener = RecordingListener::new();

    grid.publish_creates("MyCq", 3);

    let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
    let results = cq.execute_with_initial_results().await.unwrap();

    let keys: Vec<&str> = results.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["key-0", "key-1", "key-2"]);
    assert_eq!(cq.last_delivered_sequence_id(), 3);

    grid.publish("MyCq", "key-3", CqOperation::Create, Some(serde_json::json!({ "ID": 3 })));
    assert!(listener.wait_for_events(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(listener.sequence_ids(), vec![4]);
    assert!(listener.gap_errors().is_empty());
}
