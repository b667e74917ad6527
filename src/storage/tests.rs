//! Storage Module Tests
//!
//! Validates the replicated store end to end on an in-process cluster.
//!
//! ## Test Scopes
//! - **KeyMapper**: Deterministic placement and recomputation on view changes.
//! - **ReplicatedDataStore**: Versioned put/get/remove/touch, synchronous and
//!   asynchronous replication, failover reads, idle and expiry sweeps, close.
//! - **Builder**: Configuration errors, custom key hashing, interceptors.

#[cfg(test)]
mod tests {
    use crate::command::interceptor::StatsInterceptor;
    use crate::command::types::Opcode;
    use crate::membership::local::LocalCluster;
    use crate::membership::service::GroupServiceRegistry;
    use crate::membership::types::MemberName;
    use crate::storage::config::StoreConfig;
    use crate::storage::entry::{VERSION_SENTINEL, now_ms};
    use crate::storage::error::DataStoreError;
    use crate::storage::key_mapper::{KeyMapper, hash_key};
    use crate::storage::store::{ReplicatedDataStore, ReplicationStatus};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::time::Duration;

    type Store = ReplicatedDataStore<String, String>;

    // Test data structure
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestSession {
        user: String,
        cart: Vec<u32>,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn config(synchronous: bool) -> StoreConfig {
        StoreConfig::new("sessions", "cluster")
            .with_synchronous_replication(synchronous)
            .with_replication_timeout(Duration::from_millis(500))
            .with_load_timeout(Duration::from_millis(500))
    }

    fn build_store(cluster: &Arc<LocalCluster>, name: &str, config: StoreConfig) -> Store {
        let service = cluster
            .service(&MemberName::from(name))
            .expect("member should have joined");
        let registry = GroupServiceRegistry::new();
        registry.register("cluster", service);
        ReplicatedDataStore::builder(config)
            .build(&registry)
            .expect("store should build")
    }

    /// Joins every member first, then builds one store per member.
    fn cluster_of(names: &[&str], synchronous: bool) -> (Arc<LocalCluster>, Vec<Store>) {
        init_tracing();
        let cluster = LocalCluster::new();
        for name in names {
            cluster.join(*name).unwrap();
        }
        let stores = names
            .iter()
            .map(|name| build_store(&cluster, name, config(synchronous)))
            .collect();
        (cluster, stores)
    }

    /// First `sess{i}` key that `store` replicates to `target`.
    fn key_mapped_to(store: &Store, target: &str) -> String {
        (0..10_000)
            .map(|i| format!("sess{}", i))
            .find(|key| store.mapped_instance(key) == Some(MemberName::from(target)))
            .expect("some key should map to the target")
    }

    fn names(list: &[&str]) -> Vec<MemberName> {
        list.iter().map(|name| MemberName::from(*name)).collect()
    }

    // ============================================================
    // KEY MAPPER TESTS
    // ============================================================

    #[test]
    fn test_mapping_is_deterministic_and_excludes_self() {
        let mapper = KeyMapper::new(MemberName::from("a"), 3);
        let view = names(&["d", "a", "c", "b"]);
        mapper.on_view_change(&MemberName::from("a"), &view, &view, true);

        assert_eq!(mapper.members(), names(&["b", "c", "d"]));
        for i in 0..100 {
            let hash = hash_key(&format!("key_{}", i));
            let first = mapper.get_mapped_instance(hash);
            assert_eq!(first, mapper.get_mapped_instance(hash));
            assert_ne!(first, Some(MemberName::from("a")));
        }
    }

    #[test]
    fn test_view_change_drops_departed_member() {
        let mapper = KeyMapper::new(MemberName::from("a"), 3);
        let before = names(&["a", "b", "c", "d"]);
        mapper.on_view_change(&MemberName::from("a"), &before, &before, true);

        let after = names(&["a", "b", "d"]);
        mapper.on_view_change(&MemberName::from("c"), &after, &before, false);

        for i in 0..1_000 {
            let hash = hash_key(&format!("key_{}", i));
            assert_ne!(mapper.get_mapped_instance(hash), Some(MemberName::from("c")));
        }
        assert_eq!(mapper.replica_choice_table().len(), mapper.members().len());
        assert_eq!(mapper.previous_members(), names(&["b", "d"]));
        for choices in mapper.replica_choice_table() {
            assert!(!choices.members().contains(&MemberName::from("c")));
        }
    }

    #[test]
    fn test_replica_choice_windows_wrap_around() {
        let mapper = KeyMapper::new(MemberName::from("a"), 2);
        let view = names(&["a", "b", "c", "d"]);
        mapper.on_view_change(&MemberName::from("a"), &view, &view, true);

        let table: Vec<String> = mapper
            .replica_choice_table()
            .iter()
            .map(|choices| choices.to_string())
            .collect();
        assert_eq!(table, vec!["b:c", "c:d", "d:b"]);
    }

    #[test]
    fn test_empty_cluster_yields_sentinel() {
        let mapper = KeyMapper::new(MemberName::from("a"), 3);
        let view = names(&["a"]);
        mapper.on_view_change(&MemberName::from("a"), &view, &view, true);

        assert_eq!(mapper.get_mapped_instance(42), None);
        assert!(mapper.get_replica_choices(42).is_empty());
        assert_eq!(mapper.replica_choice_table().len(), 1);
        assert!(mapper.find_replica_instance(42, None).is_empty());
    }

    #[test]
    fn test_mapping_info_hint_wins_over_previous_view() {
        let mapper = KeyMapper::new(MemberName::from("c"), 3);
        let view = names(&["a", "b", "c"]);
        mapper.on_view_change(&MemberName::from("c"), &view, &view, true);

        let hint = "c:b".parse().unwrap();
        assert_eq!(
            mapper.find_replica_instance(7, Some(&hint)),
            names(&["b"]),
            "The local member is never a load candidate"
        );
    }

    // ============================================================
    // LOCAL READ / WRITE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_put_put_keeps_latest_with_higher_version() {
        let (_cluster, stores) = cluster_of(&["a", "b"], false);
        let a = &stores[0];
        let key = "sess1".to_string();

        let first = a.put(key.clone(), "v1".to_string()).await.unwrap();
        let second = a.put(key.clone(), "v2".to_string()).await.unwrap();

        assert!(second.version > first.version);
        assert_eq!(a.get(&key).await.unwrap(), Some("v2".to_string()));
        assert_eq!(second.replication, ReplicationStatus::Sent);
    }

    #[tokio::test]
    async fn test_single_member_is_local_only() {
        let (_cluster, stores) = cluster_of(&["solo"], true);
        let store = &stores[0];

        let receipt = store.put("k".to_string(), "v".to_string()).await.unwrap();

        assert_eq!(receipt.replication, ReplicationStatus::LocalOnly);
        assert!(receipt.replica_choices.is_empty());
        assert_eq!(store.get(&"missing".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_struct_values_round_trip_through_replica() {
        init_tracing();
        let cluster = LocalCluster::new();
        cluster.join("a").unwrap();
        cluster.join("b").unwrap();
        let registry_a = GroupServiceRegistry::new();
        registry_a.register("cluster", cluster.service(&MemberName::from("a")).unwrap());
        let registry_b = GroupServiceRegistry::new();
        registry_b.register("cluster", cluster.service(&MemberName::from("b")).unwrap());

        let a: ReplicatedDataStore<u64, TestSession> =
            ReplicatedDataStore::builder(config(true)).build(&registry_a).unwrap();
        let b: ReplicatedDataStore<u64, TestSession> =
            ReplicatedDataStore::builder(config(true)).build(&registry_b).unwrap();

        let session = TestSession {
            user: "alice".to_string(),
            cart: vec![3, 1, 4],
        };
        let receipt = a.put(7, session.clone()).await.unwrap();

        assert_eq!(receipt.replication, ReplicationStatus::Acknowledged);
        assert_eq!(b.get_local(&7).unwrap(), Some(session));
    }

    #[tokio::test]
    async fn test_remove_then_get_is_not_found() {
        let (cluster, stores) = cluster_of(&["a", "b"], false);
        let (a, b) = (&stores[0], &stores[1]);
        let key = "sess1".to_string();

        a.put(key.clone(), "data".to_string()).await.unwrap();
        cluster.settle().await;
        a.remove(&key).await.unwrap();
        cluster.settle().await;

        assert_eq!(a.get(&key).await.unwrap(), None);
        let local = a.entry_snapshot(&key).unwrap();
        assert!(local.removed);
        assert_eq!(local.pending_updates, 0);

        let replica = b.entry_snapshot(&key).unwrap();
        assert!(replica.removed, "The removal is replicated as a tombstone");
        assert!(!replica.has_value);
        assert_eq!(replica.pending_updates, 0);
    }

    #[tokio::test]
    async fn test_size_counts_live_entries() {
        let (_cluster, stores) = cluster_of(&["a"], false);
        let store = &stores[0];

        store.put("one".to_string(), "1".to_string()).await.unwrap();
        store.put("two".to_string(), "2".to_string()).await.unwrap();
        store.remove(&"one".to_string()).await.unwrap();

        assert_eq!(store.size(), 1);
    }

    #[tokio::test]
    async fn test_touch_requires_live_entry_and_replicates() {
        let (cluster, stores) = cluster_of(&["a", "b"], false);
        let (a, b) = (&stores[0], &stores[1]);
        let key = "sess1".to_string();

        assert!(a.touch(&key, now_ms(), Duration::from_secs(60)).await.unwrap().is_none());

        let saved = a.put(key.clone(), "data".to_string()).await.unwrap();
        cluster.settle().await;
        let touched = a
            .touch(&key, 123_456, Duration::from_secs(90))
            .await
            .unwrap()
            .expect("live entry should be touched");
        cluster.settle().await;

        assert!(touched.version > saved.version);
        let replica = b.entry_snapshot(&key).unwrap();
        assert_eq!(replica.version, touched.version);
        assert_eq!(replica.last_accessed, 123_456);
        assert_eq!(replica.max_idle_ms, 90_000);
        assert_eq!(b.get_local(&key).unwrap(), Some("data".to_string()));
    }

    // ============================================================
    // REPLICATION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_synchronous_put_lands_on_replica() {
        let (_cluster, stores) = cluster_of(&["a", "b", "c"], true);
        let (a, b) = (&stores[0], &stores[1]);
        let key = key_mapped_to(a, "b");

        let receipt = a.put(key.clone(), "data".to_string()).await.unwrap();

        assert_eq!(receipt.replication, ReplicationStatus::Acknowledged);
        let replica = b.entry_snapshot(&key).expect("b should hold the replica");
        assert!(replica.version > VERSION_SENTINEL);
        assert_eq!(replica.version, receipt.version);
        assert_eq!(replica.replica_instance_name, Some(MemberName::from("a")));
        assert_eq!(b.get_local(&key).unwrap(), Some("data".to_string()));
        assert!(stores[2].entry_snapshot(&key).is_none());
    }

    #[tokio::test]
    async fn test_synchronous_put_to_unreachable_peer_is_unacknowledged() {
        let (cluster, stores) = cluster_of(&["a", "b"], true);
        let a = &stores[0];
        cluster.set_reachable(&MemberName::from("b"), false);

        let receipt = a.put("k".to_string(), "v".to_string()).await.unwrap();

        assert_eq!(receipt.replication, ReplicationStatus::Unacknowledged);
        assert_eq!(a.get_local(&"k".to_string()).unwrap(), Some("v".to_string()));
        assert_eq!(a.manager().mediator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_is_acknowledged_in_synchronous_mode() {
        let (_cluster, stores) = cluster_of(&["a", "b"], true);
        let (a, b) = (&stores[0], &stores[1]);
        let key = "sess1".to_string();

        a.put(key.clone(), "data".to_string()).await.unwrap();
        let status = a.remove(&key).await.unwrap();

        assert_eq!(status, ReplicationStatus::Acknowledged);
        assert!(b.entry_snapshot(&key).unwrap().removed);
    }

    #[tokio::test]
    async fn test_put_after_idle_eviction_overrides_replica() {
        let (cluster, stores) = cluster_of(&["a", "b"], true);
        let (a, b) = (&stores[0], &stores[1]);
        let key = "sess1".to_string();

        let mut last = None;
        for i in 1..=3 {
            last = Some(a.put(key.clone(), format!("old{}", i)).await.unwrap());
        }
        let old = last.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(a.remove_idle_entries(Duration::ZERO), 1);
        assert!(a.entry_snapshot(&key).is_none());

        let fresh = a.put(key.clone(), "new".to_string()).await.unwrap();

        assert!(fresh.version > old.version);
        assert_eq!(fresh.replication, ReplicationStatus::Acknowledged);
        assert_eq!(b.get_local(&key).unwrap(), Some("new".to_string()));
        assert_eq!(b.entry_snapshot(&key).unwrap().version, fresh.version);

        cluster.leave(&MemberName::from("a")).unwrap();
        assert_eq!(b.get(&key).await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_put_after_tombstone_sweep_restarts_above_it() {
        let (_cluster, stores) = cluster_of(&["a", "b"], true);
        let (a, b) = (&stores[0], &stores[1]);
        let key = "sess1".to_string();

        a.put(key.clone(), "first".to_string()).await.unwrap();
        a.remove(&key).await.unwrap();
        let tombstone = b.entry_snapshot(&key).unwrap();
        assert!(tombstone.removed);

        tokio::time::sleep(Duration::from_millis(5)).await;
        a.remove_idle_entries(Duration::ZERO);

        let receipt = a.put(key.clone(), "second".to_string()).await.unwrap();

        assert!(receipt.version > tombstone.version);
        assert_eq!(receipt.replication, ReplicationStatus::Acknowledged);
        assert_eq!(b.get_local(&key).unwrap(), Some("second".to_string()));
    }

    // ============================================================
    // FAILOVER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_failover_read_adopts_replica() {
        let (cluster, stores) = cluster_of(&["a", "b", "c"], false);
        let (a, c) = (&stores[0], &stores[2]);
        let key = key_mapped_to(a, "b");

        a.put(key.clone(), "data".to_string()).await.unwrap();
        cluster.settle().await;
        cluster.leave(&MemberName::from("a")).unwrap();

        assert_eq!(c.get(&key).await.unwrap(), Some("data".to_string()));

        let adopted = c.entry_snapshot(&key).expect("value should be adopted");
        assert_eq!(adopted.replica_instance_name, Some(MemberName::from("b")));
        assert_eq!(c.get_local(&key).unwrap(), Some("data".to_string()));
    }

    #[tokio::test]
    async fn test_mapping_info_locates_replica() {
        let (cluster, stores) = cluster_of(&["a", "b", "c"], true);
        let (a, c) = (&stores[0], &stores[2]);
        let key = key_mapped_to(a, "b");

        let receipt = a.put(key.clone(), "data".to_string()).await.unwrap();
        assert!(receipt.replica_choices.members().contains(&MemberName::from("b")));
        cluster.leave(&MemberName::from("a")).unwrap();

        let value = c
            .get_with_mapping_info(&key, Some(&receipt.replica_choices))
            .await
            .unwrap();
        assert_eq!(value, Some("data".to_string()));
    }

    #[tokio::test]
    async fn test_replica_leaving_surfaces_not_found() {
        let (cluster, stores) = cluster_of(&["a", "b", "c"], false);
        let a = &stores[0];
        let key = key_mapped_to(a, "b");

        a.put(key.clone(), "data".to_string()).await.unwrap();
        cluster.settle().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(a.remove_idle_entries(Duration::ZERO), 1);

        cluster.leave(&MemberName::from("b")).unwrap();

        assert_eq!(a.key_mapper().members(), names(&["c"]));
        assert_eq!(a.key_mapper().replica_choice_table().len(), 1);
        assert_eq!(a.get(&key).await.unwrap(), None);
    }

    // ============================================================
    // SWEEP TESTS
    // ============================================================

    #[tokio::test]
    async fn test_idle_sweep_removes_only_stale_entries() {
        let (_cluster, stores) = cluster_of(&["a"], false);
        let store = &stores[0];
        let max_idle = Duration::from_secs(60);
        let max_idle_ms = max_idle.as_millis() as u64;

        store.put("fresh".to_string(), "1".to_string()).await.unwrap();
        store.put("stale".to_string(), "2".to_string()).await.unwrap();
        store.put("revived".to_string(), "3".to_string()).await.unwrap();
        let long_ago = now_ms() - 2 * max_idle_ms;
        store.touch(&"stale".to_string(), long_ago, max_idle).await.unwrap();
        store.touch(&"revived".to_string(), long_ago, max_idle).await.unwrap();

        // touched after the staleness was computed
        store
            .touch(&"revived".to_string(), now_ms(), max_idle)
            .await
            .unwrap();

        assert_eq!(store.remove_idle_entries(max_idle), 1);
        assert!(store.entry_snapshot(&"stale".to_string()).is_none());
        assert_eq!(store.get_local(&"revived".to_string()).unwrap(), Some("3".to_string()));
        assert_eq!(store.size(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_idle_sweep_runs_alongside_writes() {
        let (_cluster, mut stores) = cluster_of(&["a"], false);
        let store = Arc::new(stores.remove(0));

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    store
                        .put(format!("key_{}", i), format!("value_{}", i))
                        .await
                        .unwrap();
                }
            })
        };
        let sweeper = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut removed = 0;
                for _ in 0..50 {
                    removed += store.remove_idle_entries(Duration::from_secs(60));
                    tokio::task::yield_now().await;
                }
                removed
            })
        };

        writer.await.unwrap();
        assert_eq!(sweeper.await.unwrap(), 0);
        assert_eq!(store.size(), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_touch_during_idle_sweep_keeps_entry() {
        let (_cluster, mut stores) = cluster_of(&["a"], false);
        let store = Arc::new(stores.remove(0));
        let max_idle = Duration::from_secs(60);
        let long_ago = now_ms() - 2 * max_idle.as_millis() as u64;
        let keys: Vec<String> = (0..200).map(|i| format!("key_{}", i)).collect();

        for key in &keys {
            store.put(key.clone(), "v".to_string()).await.unwrap();
            store.touch(key, long_ago, max_idle).await.unwrap();
        }

        let toucher = {
            let store = store.clone();
            let keys = keys.clone();
            tokio::spawn(async move {
                let mut refreshed = Vec::new();
                for key in keys {
                    if store.touch(&key, now_ms(), max_idle).await.unwrap().is_some() {
                        refreshed.push(key);
                    }
                }
                refreshed
            })
        };
        let sweeper = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut removed = 0;
                for _ in 0..20 {
                    removed += store.remove_idle_entries(max_idle);
                    tokio::task::yield_now().await;
                }
                removed
            })
        };

        let refreshed = toucher.await.unwrap();
        let removed = sweeper.await.unwrap();

        // every refreshed entry survived; everything else was swept
        assert_eq!(refreshed.len() + removed, keys.len());
        for key in &refreshed {
            assert!(store.entry_snapshot(key).is_some(), "{} was touched but evicted", key);
        }
        assert_eq!(store.size(), refreshed.len());
    }

    #[tokio::test]
    async fn test_remove_expired_sweeps_peers_too() {
        let (cluster, stores) = cluster_of(&["a", "b"], false);
        let (a, b) = (&stores[0], &stores[1]);
        let key = "sess1".to_string();

        a.put(key.clone(), "data".to_string()).await.unwrap();
        cluster.settle().await;
        a.touch(&key, now_ms() - 10_000, Duration::from_millis(1))
            .await
            .unwrap();
        cluster.settle().await;
        assert!(b.entry_snapshot(&key).is_some());

        assert_eq!(a.remove_expired().unwrap(), 1);
        cluster.settle().await;

        assert!(a.entry_snapshot(&key).is_none());
        assert!(b.entry_snapshot(&key).is_none());
    }

    // ============================================================
    // LIFECYCLE & BUILDER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_close_detaches_and_rejects_calls() {
        let (cluster, stores) = cluster_of(&["a", "b"], false);
        let a = &stores[0];
        a.put("k".to_string(), "v".to_string()).await.unwrap();

        a.close();
        a.close();

        assert!(a.is_closed());
        assert_eq!(a.size(), 0);
        assert!(matches!(
            a.put("k".to_string(), "v".to_string()).await,
            Err(DataStoreError::Closed(_))
        ));
        let service = cluster.service(&MemberName::from("a")).unwrap();
        assert_eq!(service.receiver_count(), 0);
        assert_eq!(service.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_build_reports_configuration_errors() {
        let cluster = LocalCluster::new();
        let service = cluster.join("a").unwrap();
        let registry = GroupServiceRegistry::new();

        let missing_group = ReplicatedDataStore::<String, String>::builder(config(false)).build(&registry);
        assert!(matches!(missing_group, Err(DataStoreError::Configuration(_))));

        registry.register("cluster", service);
        let empty_name = ReplicatedDataStore::<String, String>::builder(StoreConfig::new("", "cluster"))
            .build(&registry);
        assert!(matches!(empty_name, Err(DataStoreError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_custom_key_hash_drives_placement() {
        init_tracing();
        let cluster = LocalCluster::new();
        for name in ["a", "b", "c"] {
            cluster.join(name).unwrap();
        }
        let registry = GroupServiceRegistry::new();
        registry.register("cluster", cluster.service(&MemberName::from("a")).unwrap());

        let store: Store = ReplicatedDataStore::builder(config(false))
            .hashable_key(|_key: &String| 0)
            .build(&registry)
            .unwrap();

        for i in 0..20 {
            assert_eq!(
                store.mapped_instance(&format!("key_{}", i)),
                Some(MemberName::from("b"))
            );
        }
    }

    #[tokio::test]
    async fn test_builder_installs_interceptors() {
        init_tracing();
        let cluster = LocalCluster::new();
        cluster.join("a").unwrap();
        cluster.join("b").unwrap();
        let registry = GroupServiceRegistry::new();
        registry.register("cluster", cluster.service(&MemberName::from("a")).unwrap());
        let _b = build_store(&cluster, "b", config(false));
        let stats = Arc::new(StatsInterceptor::new());

        let store: Store = ReplicatedDataStore::builder(config(false))
            .interceptor(stats.clone())
            .build(&registry)
            .unwrap();
        store.put("k".to_string(), "v".to_string()).await.unwrap();

        assert_eq!(store.manager().interceptor_names(), vec!["stats".to_string()]);
        assert_eq!(stats.transmitted(Opcode::Save), 1);
        assert_eq!(store.manager().stats().transmitted, 1);
    }
}
