//! Binding registry scenarios with several nodes sharing one store
//!
//! Run with: cargo test --test registry_tests

use std::sync::Arc;
use std::time::Duration;

use tether_cluster::{BindingRegistry, Error, LeasePhase, MemoryStore};
use tether_core::config::BindingConfig;
use tether_core::{LocalSessionPool, Server};

fn test_config(lease_ttl_secs: u64) -> BindingConfig {
    BindingConfig {
        endpoints: vec!["memory".to_string()],
        prefix: "cluster-test".to_string(),
        lease_ttl_secs,
        lease_retry_backoff_ms: 50,
        watch_retry_backoff_ms: 20,
        max_jitter_ms: 10,
        ..Default::default()
    }
}

async fn start_node(store: &MemoryStore, server: Server, lease_ttl_secs: u64) -> Arc<BindingRegistry> {
    let registry = Arc::new(BindingRegistry::new(
        server,
        Arc::new(LocalSessionPool::new()),
        Arc::new(store.clone()),
        test_config(lease_ttl_secs),
    ));
    registry.init().await.expect("registry init");
    registry
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_concurrent_binds_never_cross_write() {
    let store = MemoryStore::new();
    let a = start_node(&store, Server::new("connector-a", "connector", true), 5).await;
    let b = start_node(&store, Server::new("connector-b", "connector", true), 5).await;

    let writes = (1..=40).map(|uid| {
        let node = if uid % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
        async move { node.put_binding(&uid.to_string()).await }
    });
    for result in futures::future::join_all(writes).await {
        result.unwrap();
    }

    for uid in 1..=40 {
        let owner = a.get_user_frontend_id(&uid.to_string(), "connector").await.unwrap();
        let expected = if uid % 2 == 0 { "connector-a" } else { "connector-b" };
        assert_eq!(owner, expected, "uid {uid}");
    }

    assert!(eventually(|| a.online_user_count() == 40 && b.online_user_count() == 40).await);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_last_writer_wins() {
    let store = MemoryStore::new();
    let a = start_node(&store, Server::new("connector-a", "connector", true), 5).await;
    let b = start_node(&store, Server::new("connector-b", "connector", true), 5).await;

    a.put_binding("5").await.unwrap();
    b.put_binding("5").await.unwrap();
    assert_eq!(a.get_user_frontend_id("5", "connector").await.unwrap(), "connector-b");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_put_then_remove_is_not_found() {
    let store = MemoryStore::new();
    let node = start_node(&store, Server::new("connector-a", "connector", true), 5).await;

    node.put_binding("11").await.unwrap();
    node.remove_binding("11").await.unwrap();

    assert!(matches!(
        node.get_user_frontend_id("11", "connector").await,
        Err(Error::BindingNotFound { .. })
    ));
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_online_cache_follows_other_nodes() {
    let store = MemoryStore::new();
    let frontend = start_node(&store, Server::new("connector-a", "connector", true), 5).await;
    let gate = start_node(&store, Server::new("gate-a", "gate", true), 5).await;
    let backend = start_node(&store, Server::new("game-a", "game", false), 5).await;

    frontend.put_binding("100").await.unwrap();
    gate.put_binding("200").await.unwrap();

    // Every frontend type feeds the same online set
    assert!(eventually(|| backend.is_user_online(100) && backend.is_user_online(200)).await);
    assert!(!backend.is_user_online(300));

    frontend.remove_binding("100").await.unwrap();
    assert!(eventually(|| !backend.is_user_online(100)).await);
    assert!(backend.is_user_online(200));

    for node in [frontend, gate, backend] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_crashed_node_bindings_expire_with_lease() {
    let store = MemoryStore::new();
    let crashed = start_node(&store, Server::new("connector-a", "connector", true), 1).await;
    let observer = start_node(&store, Server::new("game-a", "game", false), 5).await;

    crashed.put_binding("77").await.unwrap();
    assert!(eventually(|| observer.is_user_online(77)).await);

    // Shutdown stops renewing without revoking, like a crash would
    crashed.shutdown().await.unwrap();
    assert!(observer.is_user_online(77));

    assert!(eventually(|| !observer.is_user_online(77)).await);
    assert!(matches!(
        observer.get_user_frontend_id("77", "connector").await,
        Err(Error::BindingNotFound { .. })
    ));
    observer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rebootstrap_restores_bindings_and_writes() {
    let store = MemoryStore::new();
    let node = start_node(&store, Server::new("connector-a", "connector", true), 5).await;
    let observer = start_node(&store, Server::new("game-a", "game", false), 5).await;

    node.put_binding("1").await.unwrap();
    let first = node.lease_id().unwrap();

    assert!(store.revoke_lease(first));
    assert!(eventually(|| node.lease_state() == LeasePhase::Active && node.lease_id() != Some(first)).await);

    node.put_binding("2").await.unwrap();
    assert!(eventually(|| observer.is_user_online(1) && observer.is_user_online(2)).await);

    node.shutdown().await.unwrap();
    observer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_watch_recovers_after_outage() {
    let store = MemoryStore::new();
    let writer = start_node(&store, Server::new("connector-a", "connector", true), 5).await;
    let observer = start_node(&store, Server::new("game-a", "game", false), 5).await;

    store.set_available(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.set_available(true);

    assert!(eventually(|| writer.lease_state() == LeasePhase::Active).await);
    // Give the watcher its retry window, then write
    let mut seen = false;
    for _ in 0..50 {
        writer.put_binding("55").await.unwrap();
        if eventually(|| observer.is_user_online(55)).await {
            seen = true;
            break;
        }
    }
    assert!(seen);

    writer.shutdown().await.unwrap();
    observer.shutdown().await.unwrap();
}
