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

#[cfg(test)]
mod registry_tests {
    use super::super::*;
    use crate::channels::{CqState, LifecycleKind};
    use crate::error::CqError;
    use crate::test_support::{grid_registry, test_config, InMemoryGrid, RecordingListener};
    use std::sync::Arc;
    use std::time::Duration;

    const PREDICATE: &str = "SELECT * FROM /Portfolios p WHERE p.ID != 1";

    fn attributes(listener: &Arc<RecordingListener>) -> Arc<CqAttributes> {
        CqAttributes::builder(PREDICATE)
            .listener(listener.handle("recorder"))
            .build()
    }

    #[tokio::test]
    async fn test_register_starts_stopped() {
        let grid = InMemoryGrid::with_servers(2);
        let registry = grid_registry(&grid, test_config(1), None);
        let listener = RecordingListener::new();

        let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
        assert_eq!(cq.state().await, CqState::Stopped);
        assert_eq!(cq.region(), "Portfolios");
        assert_eq!(cq.predicate().await, PREDICATE);
        assert!(registry.lookup("MyCq").await.is_some());
        assert_eq!(grid.stream_count("MyCq"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let grid = InMemoryGrid::with_servers(1);
        let registry = grid_registry(&grid, test_config(0), None);
        let listener = RecordingListener::new();

        registry.register("MyCq", attributes(&listener)).await.unwrap();
        let result = registry.register("MyCq", attributes(&listener)).await;
        assert!(matches!(result, Err(CqError::DuplicateName { name }) if name == "MyCq"));
    }

    #[tokio::test]
    async fn test_register_requires_name_and_region() {
        let grid = InMemoryGrid::with_servers(1);
        let registry = grid_registry(&grid, test_config(0), None);

        let empty = registry
            .register("  ", CqAttributes::builder(PREDICATE).build())
            .await;
        assert!(matches!(empty, Err(CqError::InvalidConfig { .. })));

        let no_region = registry
            .register("MyCq", CqAttributes::builder("ID != 1").build())
            .await;
        assert!(matches!(no_region, Err(CqError::InvalidConfig { .. })));

        let explicit = registry
            .register(
                "MyCq",
                CqAttributes::builder("ID != 1").region("Portfolios").build(),
            )
            .await
            .unwrap();
        assert_eq!(explicit.region(), "Portfolios");
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let grid = InMemoryGrid::with_servers(2);
        let registry = grid_registry(&grid, test_config(1), None);
        let listener = RecordingListener::new();
        let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();

        cq.start().await.unwrap();
        assert!(cq.is_running().await);
        assert!(matches!(
            cq.start().await,
            Err(CqError::AlreadyRunning { .. })
        ));
        assert_eq!(grid.stream_count("MyCq"), 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let grid = InMemoryGrid::with_servers(2);
        let registry = grid_registry(&grid, test_config(1), None);
        let listener = RecordingListener::new();
        let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();

        cq.start().await.unwrap();
        cq.stop().await.unwrap();
        let events_after_first = registry.events("MyCq").await.len();

        cq.stop().await.unwrap();
        assert!(cq.is_stopped().await);
        assert_eq!(registry.events("MyCq").await.len(), events_after_first);
        assert_eq!(grid.stream_count("MyCq"), 0);
        assert_eq!(listener.close_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let grid = InMemoryGrid::with_servers(2);
        let registry = grid_registry(&grid, test_config(1), None);
        let listener = RecordingListener::new();
        let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
        cq.start().await.unwrap();

        cq.close().await.unwrap();
        cq.close().await.unwrap();

        assert!(cq.is_closed().await);
        assert_eq!(listener.close_count(), 1);
        assert_eq!(grid.stream_count("MyCq"), 0);
        assert!(registry.lookup("MyCq").await.is_none());
        assert!(matches!(cq.start().await, Err(CqError::Closed { .. })));
        assert!(matches!(cq.stop().await, Err(CqError::Closed { .. })));

        let closes = registry
            .events("MyCq")
            .await
            .into_iter()
            .filter(|e| e.kind == LifecycleKind::Closed)
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_close_from_stopped() {
        let grid = InMemoryGrid::with_servers(1);
        let registry = grid_registry(&grid, test_config(0), None);
        let listener = RecordingListener::new();
        let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();

        cq.close().await.unwrap();
        assert!(cq.is_closed().await);
        assert_eq!(listener.close_count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_closes_and_ignores_unknown_names() {
        let grid = InMemoryGrid::with_servers(2);
        let registry = grid_registry(&grid, test_config(1), None);
        let listener = RecordingListener::new();
        let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();
        cq.start().await.unwrap();

        registry.unregister("MyCq").await.unwrap();
        registry.unregister("MyCq").await.unwrap();
        registry.unregister("NeverRegistered").await.unwrap();

        assert!(cq.is_closed().await);
        assert_eq!(listener.close_count(), 1);
        assert!(matches!(
            registry.get("MyCq").await,
            Err(CqError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_name_reusable_after_close() {
        let grid = InMemoryGrid::with_servers(1);
        let registry = grid_registry(&grid, test_config(0), None);
        let listener = RecordingListener::new();

        let first = registry.register("MyCq", attributes(&listener)).await.unwrap();
        first.close().await.unwrap();

        let second = registry.register("MyCq", attributes(&listener)).await.unwrap();
        // Closing the stale handle again must not evict the new registration
        first.close().await.unwrap();
        assert!(Arc::ptr_eq(&registry.get("MyCq").await.unwrap(), &second));
    }

    #[tokio::test]
    async fn test_close_all_rejects_new_registrations() {
        let grid = InMemoryGrid::with_servers(2);
        let registry = grid_registry(&grid, test_config(1), None);
        let first = RecordingListener::new();
        let second = RecordingListener::new();

        let a = registry.register("A", attributes(&first)).await.unwrap();
        let b = registry.register("B", attributes(&second)).await.unwrap();
        a.start().await.unwrap();

        registry.close_all().await.unwrap();

        assert!(registry.is_closed().await);
        assert!(a.is_closed().await && b.is_closed().await);
        assert_eq!(first.close_count(), 1);
        assert_eq!(second.close_count(), 1);
        assert!(registry.list().await.is_empty());
        assert!(matches!(
            registry.register("C", attributes(&first)).await,
            Err(CqError::RegistryClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_all_races_registrations() {
        let grid = InMemoryGrid::with_servers(1);
        let registry = Arc::new(grid_registry(&grid, test_config(0), None));
        let listener = RecordingListener::new();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let registry = registry.clone();
            let attributes = attributes(&listener);
            tasks.push(tokio::spawn(async move {
                registry.register(format!("cq-{i}"), attributes).await
            }));
        }
        registry.close_all().await.unwrap();

        for task in tasks {
            match task.await.unwrap() {
                Ok(cq) => assert!(cq.is_closed().await || registry.lookup(cq.name()).await.is_none()),
                Err(e) => assert!(matches!(e, CqError::RegistryClosed)),
            }
        }
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_mutator_swaps_listeners() {
        let grid = InMemoryGrid::with_servers(1);
        let registry = grid_registry(&grid, test_config(0), None);
        let original = RecordingListener::new();
        let added = RecordingListener::new();
        let cq = registry.register("MyCq", attributes(&original)).await.unwrap();
        cq.start().await.unwrap();

        cq.attributes_mutator()
            .add_listener(added.handle("added"))
            .await
            .unwrap();
        grid.publish_creates("MyCq", 1);
        assert!(added.wait_for_events(1, Duration::from_secs(2)).await);
        assert!(original.wait_for_events(1, Duration::from_secs(2)).await);

        let removed = cq
            .attributes_mutator()
            .remove_listener("recorder")
            .await
            .unwrap();
        assert!(removed);
        assert!(!cq
            .attributes_mutator()
            .remove_listener("recorder")
            .await
            .unwrap());

        grid.publish_creates("MyCq", 1);
        assert!(added.wait_for_events(2, Duration::from_secs(2)).await);
        assert_eq!(original.event_count(), 1);
        // Removal does not close
        assert_eq!(original.close_count(), 0);

        cq.close().await.unwrap();
        assert_eq!(added.close_count(), 1);
        assert!(matches!(
            cq.attributes_mutator().set_listeners(Vec::new()).await,
            Err(CqError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_all_and_service_statistics() {
        let grid = InMemoryGrid::with_servers(2);
        let registry = grid_registry(&grid, test_config(1), None);
        let listener = RecordingListener::new();

        for name in ["A", "B", "C"] {
            registry.register(name, attributes(&listener)).await.unwrap();
        }
        registry.execute_all().await.unwrap();
        registry.get("C").await.unwrap().stop().await.unwrap();
        registry.unregister("B").await.unwrap();

        let stats = registry.service_statistics().await;
        assert_eq!(stats.num_cqs_created, 3);
        assert_eq!(stats.num_cqs_active, 1);
        assert_eq!(stats.num_cqs_stopped, 1);
        assert_eq!(stats.num_cqs_closed, 1);
        assert_eq!(stats.num_cqs_on_client, 2);

        assert_eq!(
            registry.list().await,
            vec![
                ("A".to_string(), CqState::Running),
                ("C".to_string(), CqState::Stopped)
            ]
        );
        assert_eq!(registry.cqs_for_region("Portfolios").await.len(), 2);
        assert!(registry.cqs_for_region("Positions").await.is_empty());

        registry.stop_all().await.unwrap();
        assert!(registry.get("A").await.unwrap().is_stopped().await);
    }

    #[tokio::test]
    async fn test_start_fails_without_servers() {
        let grid = InMemoryGrid::new();
        let registry = grid_registry(&grid, test_config(1), None);
        let listener = RecordingListener::new();
        let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();

        let result = cq.start().await;
        assert!(matches!(result, Err(CqError::Establish { .. })));
        assert!(cq.is_stopped().await);
        assert!(registry
            .last_error("MyCq")
            .await
            .is_some_and(|message| message.contains("no candidate servers")));

        // Recovers once a server shows up
        grid.add_server("server-1");
        cq.start().await.unwrap();
        assert!(cq.is_running().await);
    }

    #[tokio::test]
    async fn test_subscribe_events_streams_lifecycle() {
        let grid = InMemoryGrid::with_servers(1);
        let registry = grid_registry(&grid, test_config(0), None);
        let listener = RecordingListener::new();
        let cq = registry.register("MyCq", attributes(&listener)).await.unwrap();

        let (history, mut live) = registry.subscribe_events("MyCq").await.unwrap();
        assert_eq!(history[0].kind, LifecycleKind::Registered);

        cq.start().await.unwrap();
        let started = live.recv().await.unwrap();
        assert_eq!(started.kind, LifecycleKind::Started);
        assert_eq!(started.state, CqState::Running);

        assert!(registry.subscribe_events("Unknown").await.is_none());
    }

    #[test]
    fn test_builder_requires_connector() {
        let result = QueryRegistry::builder().build();
        assert!(matches!(result, Err(CqError::InvalidConfig { .. })));
    }
}
