mod common;

use common::*;
use gridload::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn contents(cluster: &InProcessCluster, keys: usize) -> BTreeMap<(NodeId, String), RecordValue> {
    let mut contents = BTreeMap::new();
    for node in cluster.nodes() {
        for i in 0..keys {
            let key = format!("key-{i:03}");
            if let Some(value) = node.get_local(CACHE, &key).await {
                contents.insert((node.id().clone(), key), value);
            }
        }
    }
    contents
}

#[tokio::test]
async fn three_nodes_with_backups() {
    let cluster = cluster_with(&["n1", "n2", "n3"], 1, Arc::new(numbered_store(300)));

    let outcome = cluster
        .coordinator()
        .unwrap()
        .load_cache(LoadCacheRequest::new(CACHE, TIMEOUT))
        .await
        .unwrap();

    assert_eq!(outcome.status, OverallStatus::Success);
    assert_eq!(outcome.loaded_count, 300);
    assert_eq!(outcome.degraded_replication_count, 0);
    assert_eq!(outcome.per_node.len(), 3);
    for result in outcome.per_node.values() {
        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.loaded, 100, "node {}", result.node);
    }

    // Primary and backup both hold every key.
    let topology = cluster.topology(CACHE).await.unwrap();
    assert_eq!(topology.version, outcome.topology_version);
    for i in 0..300 {
        let key = format!("key-{i:03}");
        let assignment = topology.assignment(topology.partition_of(&key)).unwrap();
        assert_eq!(assignment.backups.len(), 1);
        for owner in std::iter::once(&assignment.primary).chain(&assignment.backups) {
            let node = cluster.node(owner).unwrap();
            assert_eq!(node.get_local(CACHE, &key).await, Some(serde_json::json!(i)), "{key} on {owner}");
        }
    }
    for node in cluster.nodes() {
        assert_eq!(node.local_len(CACHE), 200);
    }
}

#[tokio::test]
async fn loading_twice_changes_nothing() {
    let cluster = cluster_with(&["n1", "n2", "n3"], 1, Arc::new(numbered_store(300)));
    let coordinator = cluster.coordinator().unwrap();

    let first = coordinator
        .load_cache(LoadCacheRequest::new(CACHE, TIMEOUT))
        .await
        .unwrap();
    let after_first = contents(&cluster, 300).await;

    let second = coordinator
        .load_cache(LoadCacheRequest::new(CACHE, TIMEOUT))
        .await
        .unwrap();
    let after_second = contents(&cluster, 300).await;

    assert!(first.is_success() && second.is_success());
    assert_ne!(first.load_id, second.load_id);
    assert_eq!(first.loaded_count, second.loaded_count);
    assert_eq!(after_first.len(), 600);
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn no_owners_means_no_messages() {
    let cluster = cluster_with(&[], 1, Arc::new(numbered_store(10)));
    let transport = Arc::new(CountingTransport::new(cluster.clone()));
    let coordinator = BroadcastCoordinator::new(cluster.clone(), transport.clone(), fast_retries()).unwrap();

    let outcome = coordinator
        .load_cache(LoadCacheRequest::new(CACHE, TIMEOUT))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.loaded_count, 0);
    assert!(outcome.per_node.is_empty());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn unknown_cache_is_not_loaded() {
    let cluster = cluster_with(&["n1"], 0, Arc::new(numbered_store(10)));

    let err = cluster
        .coordinator()
        .unwrap()
        .load_cache(LoadCacheRequest::new("nonexistent", TIMEOUT))
        .await
        .unwrap_err();

    assert!(
        matches!(err, LoadError::TopologyUnavailable { ref cache, .. } if cache == "nonexistent"),
        "unexpected error: {err}"
    );
    assert_eq!(cluster.node(&id("n1")).unwrap().local_len("nonexistent"), 0);
}

#[tokio::test]
async fn store_failure_is_confined_to_its_node() {
    let store = numbered_store(300);
    let cluster = InProcessCluster::new(fast_retries());
    cluster.add_node("n1", Arc::new(store.clone()));
    cluster.add_node(
        "n2",
        Arc::new(FailingStore {
            inner:      store.clone(),
            fail_after: 37,
        }),
    );
    cluster.add_node("n3", Arc::new(store));
    cluster
        .define_cache(
            CacheConfig::builder()
                .name(CACHE)
                .affinity(thirds())
                .backups(0)
                .build()
                .unwrap(),
        )
        .unwrap();

    let outcome = cluster
        .coordinator()
        .unwrap()
        .load_cache(LoadCacheRequest::new(CACHE, TIMEOUT))
        .await
        .unwrap();

    assert_eq!(outcome.status, OverallStatus::PartialFailure);
    assert_eq!(outcome.failed_nodes(), vec![id("n2")]);
    assert_eq!(outcome.loaded_count, 237);

    let failed = &outcome.per_node[&id("n2")];
    assert_eq!(failed.status, NodeStatus::StoreReadFailure);
    assert_eq!(failed.loaded, 37);
    assert!(failed.error.as_deref().unwrap_or_default().contains("connection lost"));
    // Nothing is rolled back.
    assert_eq!(cluster.node(&id("n2")).unwrap().local_len(CACHE), 37);

    for ok in ["n1", "n3"] {
        assert_eq!(outcome.per_node[&id(ok)].status, NodeStatus::Success);
        assert_eq!(outcome.per_node[&id(ok)].loaded, 100);
    }
}

#[tokio::test]
async fn cancelled_load_keeps_what_was_committed() {
    let store = Arc::new(SlowStore::new(numbered_store(300), Duration::from_millis(20)));
    let cluster = cluster_with(&["n1", "n2", "n3"], 0, store.clone());
    let coordinator = cluster.coordinator().unwrap();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        }
    });

    let outcome = coordinator
        .load_cache_with_cancel(LoadCacheRequest::new(CACHE, TIMEOUT), cancel)
        .await
        .unwrap();

    assert_eq!(outcome.status, OverallStatus::PartialFailure);
    assert_eq!(outcome.per_node.len(), 3);
    assert!(outcome.loaded_count < 300);

    let mut committed = 0;
    for (node, result) in &outcome.per_node {
        assert!(
            matches!(result.status, NodeStatus::Cancelled | NodeStatus::Timeout),
            "{node} reported {}",
            result.status
        );
        if result.status == NodeStatus::Cancelled {
            assert_eq!(cluster.node(node).unwrap().local_len(CACHE) as u64, result.loaded);
        }
        committed += result.loaded;
    }
    assert_eq!(outcome.loaded_count, committed);

    // Scans are released, not merely abandoned.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.released(), 3);
}

#[tokio::test]
async fn nodes_stop_at_the_deadline() {
    let store = Arc::new(SlowStore::new(numbered_store(300), Duration::from_millis(20)));
    let cluster = cluster_with(&["n1", "n2", "n3"], 1, store);

    let outcome = cluster
        .coordinator()
        .unwrap()
        .load_cache(LoadCacheRequest::new(CACHE, Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(outcome.status, OverallStatus::PartialFailure);
    assert!(outcome
        .per_node
        .values()
        .all(|r| matches!(r.status, NodeStatus::Cancelled | NodeStatus::Timeout)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in cluster.nodes() {
        assert_eq!(node.active_loads(), 0, "{} is still loading", node.id());
    }
}

#[tokio::test]
async fn silent_node_times_out_within_the_timeout() {
    let cluster = cluster_with(&["n1", "n2", "n3"], 0, Arc::new(numbered_store(300)));
    let transport = Arc::new(SilentTransport {
        inner:  cluster.clone(),
        silent: id("n2"),
    });
    let coordinator = BroadcastCoordinator::new(cluster.clone(), transport, fast_retries()).unwrap();

    let timeout = Duration::from_secs(1);
    let started = Instant::now();
    let outcome = coordinator
        .load_cache(LoadCacheRequest::new(CACHE, timeout))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < timeout + Duration::from_millis(250), "load took {elapsed:?}");
    assert_eq!(outcome.status, OverallStatus::PartialFailure);
    assert_eq!(outcome.failed_nodes(), vec![id("n2")]);
    assert_eq!(outcome.per_node[&id("n2")].status, NodeStatus::Timeout);
    assert_eq!(outcome.per_node[&id("n2")].loaded, 0);
    for ok in ["n1", "n3"] {
        assert_eq!(outcome.per_node[&id(ok)].status, NodeStatus::Success);
        assert_eq!(outcome.per_node[&id(ok)].loaded, 100);
    }
    assert_eq!(outcome.loaded_count, 200);
}

#[tokio::test]
async fn unbounded_timeout() {
    let cluster = cluster_with(&["n1", "n2", "n3"], 1, Arc::new(numbered_store(300)));

    let outcome = cluster
        .coordinator()
        .unwrap()
        .load_cache(LoadCacheRequest::new(CACHE, Duration::MAX))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.loaded_count, 300);
}

#[tokio::test]
async fn shutdown_aborts_loads() {
    let store = Arc::new(SlowStore::new(numbered_store(300), Duration::from_millis(20)));
    let cluster = cluster_with(&["n1", "n2", "n3"], 0, store);
    let coordinator = cluster.coordinator().unwrap();

    coordinator.shutdown();
    assert!(coordinator.is_shut_down());

    let outcome = coordinator
        .load_cache(LoadCacheRequest::new(CACHE, TIMEOUT))
        .await
        .unwrap();
    assert_eq!(outcome.status, OverallStatus::PartialFailure);
    assert!(outcome.loaded_count < 300);
    assert!(outcome
        .per_node
        .values()
        .all(|r| matches!(r.status, NodeStatus::Cancelled | NodeStatus::Timeout)));
}

#[tokio::test]
async fn lost_backups_degrade_but_do_not_fail() {
    // With four members the fourth one is backup of the last range and primary of nothing.
    let cluster = cluster_with(&["n1", "n2", "n3", "n4"], 1, Arc::new(numbered_store(300)));
    cluster.set_reachable(&id("n4"), false);

    let outcome = cluster
        .coordinator()
        .unwrap()
        .load_cache(LoadCacheRequest::new(CACHE, TIMEOUT))
        .await
        .unwrap();

    assert_eq!(outcome.status, OverallStatus::Success);
    assert_eq!(outcome.loaded_count, 300);
    assert_eq!(outcome.per_node.len(), 3);
    assert_eq!(outcome.degraded_replication_count, 100);
    assert_eq!(outcome.per_node[&id("n3")].degraded_replication, 100);
    assert_eq!(outcome.per_node[&id("n1")].degraded_replication, 0);

    let reader = cluster.reader();
    for i in [200, 250, 299] {
        let key = format!("key-{i:03}");
        assert_eq!(reader.get(CACHE, &key).await.unwrap(), Some(serde_json::json!(i)));
    }
    assert_eq!(cluster.node(&id("n4")).unwrap().local_len(CACHE), 0);
}

#[tokio::test]
async fn failed_nodes_can_be_reloaded() {
    let cluster = cluster_with(&["n1", "n2", "n3"], 1, Arc::new(numbered_store(300)));
    let coordinator = cluster.coordinator().unwrap();

    cluster.set_reachable(&id("n2"), false);
    let outcome = coordinator
        .load_cache(LoadCacheRequest::new(CACHE, TIMEOUT))
        .await
        .unwrap();
    assert_eq!(outcome.status, OverallStatus::PartialFailure);
    assert_eq!(outcome.failed_nodes(), vec![id("n2")]);
    assert_eq!(outcome.per_node[&id("n2")].status, NodeStatus::Timeout);
    assert_eq!(outcome.loaded_count, 200);

    cluster.set_reachable(&id("n2"), true);
    let retry = coordinator
        .reload_nodes(LoadCacheRequest::new(CACHE, TIMEOUT), &outcome.failed_nodes())
        .await
        .unwrap();
    assert!(retry.is_success());
    assert_eq!(retry.per_node.len(), 1);
    assert_eq!(retry.loaded_count, 100);

    let reader = cluster.reader();
    for i in 0..300 {
        let key = format!("key-{i:03}");
        assert_eq!(reader.get(CACHE, &key).await.unwrap(), Some(serde_json::json!(i)), "{key}");
    }
}

#[tokio::test]
async fn reload_skips_nodes_without_partitions() {
    let cluster = cluster_with(&["n1", "n2", "n3", "n4"], 1, Arc::new(numbered_store(300)));

    let outcome = cluster
        .coordinator()
        .unwrap()
        .reload_nodes(LoadCacheRequest::new(CACHE, TIMEOUT), &[id("n4"), id("ghost")])
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert!(outcome.per_node.is_empty());
}

#[tokio::test]
async fn filtered_load() {
    let cluster = cluster_with(&["n1", "n2", "n3"], 0, Arc::new(numbered_store(300)));

    let request = LoadCacheRequest::new(CACHE, TIMEOUT)
        .filter(RecordFilter::And(vec![
            RecordFilter::KeyPrefix("key-1".into()),
            RecordFilter::field("", CmpOp::Ge, Operand::Param(0)),
        ]))
        .args(StoreArgs::default().param(serde_json::json!(150)));
    let outcome = cluster.coordinator().unwrap().load_cache(request).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.loaded_count, 50);
    assert_eq!(outcome.per_node[&id("n2")].loaded, 50);
    assert_eq!(outcome.per_node[&id("n1")].loaded, 0);
}
