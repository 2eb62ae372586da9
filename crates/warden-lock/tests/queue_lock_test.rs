//! Integration tests for the queue-ordered lock
//!
//! Exercises exclusion, FIFO hand-off and session-loss recovery against the
//! in-memory coordinator. The ZooKeeper tests are ignored by default; run them
//! with `WARDEN_TEST_ZK_URL=127.0.0.1:2181 cargo test --features zookeeper -- --ignored`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use warden_lock::{QueueLockClient, QueueLockOptions, QueueLockState};
use warden_store::{CoordinationService, MemoryCoordinator};

async fn client(coordinator: &MemoryCoordinator) -> QueueLockClient {
    QueueLockClient::new(Arc::new(coordinator.connect()), QueueLockOptions::default())
        .await
        .unwrap()
}

async fn wait_for_queue_len(observer: &dyn CoordinationService, len: usize) {
    for _ in 0..200 {
        if observer.list_children("/distributed").await.unwrap().len() == len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("queue never reached {} nodes", len);
}

// ============================================================================
// Mutual Exclusion Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_holder() {
    let coordinator = MemoryCoordinator::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));
    let workers = 8;
    let rounds = 4;

    let mut tasks = Vec::new();
    for _ in 0..workers {
        let client = client(&coordinator).await;
        let inside = inside.clone();
        let entries = entries.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..rounds {
                let mut lock = client.queue_lock("stock");
                lock.lock().await.unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                entries.fetch_add(1, Ordering::SeqCst);
                lock.unlock().await.unwrap();
            }
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(entries.load(Ordering::SeqCst), workers * rounds);
}

// ============================================================================
// Fairness Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_enter_in_enqueue_order() {
    let coordinator = MemoryCoordinator::new();
    let observer = coordinator.connect();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = client(&coordinator).await;
    let mut gate = first.queue_lock("stock");
    gate.lock().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..6 {
        let client = client(&coordinator).await;
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            let mut lock = client.queue_lock("stock");
            lock.lock().await.unwrap();
            order.lock().push(i);
            lock.unlock().await.unwrap();
        }));
        wait_for_queue_len(&observer, i + 2).await;
    }

    gate.unlock().await.unwrap();
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_abandoned_waiter_does_not_block_successor() {
    let coordinator = MemoryCoordinator::new();
    let observer = coordinator.connect();
    let holder = client(&coordinator).await;
    let quitter = client(&coordinator).await;
    let patient = client(&coordinator).await;

    let mut held = holder.queue_lock("stock");
    held.lock().await.unwrap();

    let mut gives_up = quitter.queue_lock("stock");
    let quitting = tokio::spawn(async move {
        gives_up.try_lock_for(Duration::from_millis(40)).await.unwrap()
    });
    wait_for_queue_len(&observer, 2).await;

    let mut waits = patient.queue_lock("stock");
    let waiting = tokio::spawn(async move {
        waits.lock().await.unwrap();
        let state = waits.state();
        waits.unlock().await.unwrap();
        state
    });
    wait_for_queue_len(&observer, 3).await;

    assert!(!quitting.await.unwrap());
    wait_for_queue_len(&observer, 2).await;
    held.unlock().await.unwrap();
    assert_eq!(waiting.await.unwrap(), QueueLockState::Holding);
}

// ============================================================================
// Failure Safety Tests
// ============================================================================

#[tokio::test]
async fn test_crashed_holder_releases_with_its_session() {
    let coordinator = MemoryCoordinator::new();
    let crashed_session = Arc::new(coordinator.connect());
    let crashed_id = crashed_session.session_id();
    let crashed = QueueLockClient::new(crashed_session, QueueLockOptions::default())
        .await
        .unwrap();
    let survivor = client(&coordinator).await;

    let mut held = crashed.queue_lock("stock");
    held.lock().await.unwrap();

    let mut waiter = survivor.queue_lock("stock");
    let waiting = tokio::spawn(async move {
        waiter.lock().await.unwrap();
        waiter
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiting.is_finished());

    coordinator.expire_session(crashed_id);
    let mut waiter = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(waiter.state(), QueueLockState::Holding);
    waiter.unlock().await.unwrap();
}

#[tokio::test]
async fn test_dropped_handle_removes_its_node() {
    let coordinator = MemoryCoordinator::new();
    let client = client(&coordinator).await;

    let mut lock = client.queue_lock("stock");
    lock.lock().await.unwrap();
    let node = lock.node_path().unwrap().to_string();
    drop(lock);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!coordinator.node_exists(&node));

    let mut next = client.queue_lock("stock");
    assert!(next.try_lock_for(Duration::from_millis(50)).await.unwrap());
    next.unlock().await.unwrap();
}

// ============================================================================
// ZooKeeper Tests
// ============================================================================

#[cfg(feature = "zookeeper")]
mod zookeeper_backend {
    use super::*;
    use warden_store::ZooKeeperCoordinator;

    async fn session() -> Arc<ZooKeeperCoordinator> {
        let url = std::env::var("WARDEN_TEST_ZK_URL").unwrap_or_else(|_| "127.0.0.1:2181".into());
        Arc::new(
            ZooKeeperCoordinator::connect(&url, Duration::from_secs(10))
                .await
                .unwrap(),
        )
    }

    fn options(root: &str) -> QueueLockOptions {
        QueueLockOptions {
            root_path: root.to_string(),
            retry_backoff_ms: 50,
        }
    }

    fn unique_root() -> String {
        format!("/warden-test/{}", uuid::Uuid::new_v4())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a running zookeeper server"]
    async fn test_zookeeper_sessions_exclude_each_other() {
        let root = unique_root();
        let inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let client = QueueLockClient::new(session().await, options(&root))
                .await
                .unwrap();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..3 {
                    let mut lock = client.queue_lock("stock");
                    lock.lock().await.unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock.unlock().await.unwrap();
                }
            }));
        }
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires a running zookeeper server"]
    async fn test_zookeeper_waiter_follows_released_holder() {
        let root = unique_root();
        let observer = session().await;
        let holder = QueueLockClient::new(session().await, options(&root))
            .await
            .unwrap();
        let waiter = QueueLockClient::new(session().await, options(&root))
            .await
            .unwrap();

        let mut held = holder.queue_lock("stock");
        held.lock().await.unwrap();
        assert_eq!(held.state(), QueueLockState::Holding);

        let mut waits = waiter.queue_lock("stock");
        let waiting = tokio::spawn(async move {
            waits.lock().await.unwrap();
            waits.unlock().await.unwrap();
        });
        for _ in 0..200 {
            if observer.list_children(&root).await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!waiting.is_finished());

        held.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(observer.list_children(&root).await.unwrap().is_empty());
    }
}
