mod common;

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clustered_singleton::{Cancellable, InMemoryCoordinationStore, Schedule, SchedulerConfig};
use common::{counting_task, eventually, fast_config, Node, OverlapCounter};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_node_runs_a_shared_task() {
    let cluster = InMemoryCoordinationStore::default();
    let counter = OverlapCounter::default();
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for port in 1..=3 {
        let node = Node::start(&cluster, port, fast_config()).await;
        handles.push(
            node.scheduler
                .schedule(
                    Schedule::builder("report").every(Duration::from_millis(25)).build(),
                    counter.task(Duration::from_millis(15)),
                )
                .await
                .unwrap(),
        );
        nodes.push(node);
    }

    assert!(eventually(Duration::from_secs(3), || counter.runs() >= 5).await);
    assert_eq!(counter.overlaps(), 0);
    assert_eq!(handles.iter().filter(|h| h.is_owner()).count(), 1);

    for node in &nodes {
        node.scheduler.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_shot_survives_owner_crash_and_runs_once() {
    let cluster = InMemoryCoordinationStore::default();
    let counters: Vec<Arc<AtomicU32>> = (0..2).map(|_| Arc::new(AtomicU32::new(0))).collect();
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for (i, counter) in counters.iter().enumerate() {
        let node = Node::start(&cluster, 10 + i as u16, fast_config()).await;
        handles.push(
            node.scheduler
                .schedule(
                    Schedule::builder("migrate")
                        .run_once_after(Duration::from_millis(300))
                        .build(),
                    counting_task(counter.clone()),
                )
                .await
                .unwrap(),
        );
        nodes.push(node);
    }

    assert!(eventually(Duration::from_secs(1), || handles.iter().any(|h| h.is_owner())).await);
    let owner = handles.iter().position(|h| h.is_owner()).unwrap();
    let survivor = 1 - owner;
    nodes[owner].session.kill();

    assert!(eventually(Duration::from_secs(3), || handles[survivor].is_done()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counters[owner].load(Ordering::SeqCst), 0);
    assert_eq!(counters[survivor].load(Ordering::SeqCst), 1);
    assert!(cluster.node_exists("/clustered_singleton/done/1.0.0/migrate"));

    for node in &nodes {
        node.scheduler.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_disconnect_keeps_ownership() {
    let cluster = InMemoryCoordinationStore::new(Duration::from_millis(300));
    let a_runs = Arc::new(AtomicU32::new(0));
    let b_runs = Arc::new(AtomicU32::new(0));

    let a = Node::start(&cluster, 21, fast_config()).await;
    let a_handle = a
        .scheduler
        .schedule(
            Schedule::builder("ticker").every(Duration::from_millis(30)).build(),
            counting_task(a_runs.clone()),
        )
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || a_handle.is_owner()).await);

    let b = Node::start(&cluster, 22, fast_config()).await;
    let b_handle = b
        .scheduler
        .schedule(
            Schedule::builder("ticker").every(Duration::from_millis(30)).build(),
            counting_task(b_runs.clone()),
        )
        .await
        .unwrap();

    a.session.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.session.reconnect();

    // Runs resume once the deferred check confirms the claim survived.
    let before = a_runs.load(Ordering::SeqCst);
    assert!(
        eventually(Duration::from_secs(2), || a_runs.load(Ordering::SeqCst) > before + 2).await
    );
    assert!(a_handle.is_owner());
    assert!(!b_handle.is_owner());
    assert_eq!(b_runs.load(Ordering::SeqCst), 0);

    a.scheduler.close().await.unwrap();
    b.scheduler.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_expiry_leaves_exactly_one_owner() {
    let cluster = InMemoryCoordinationStore::new(Duration::from_millis(300));
    let counter = OverlapCounter::default();

    let a = Node::start(&cluster, 31, fast_config()).await;
    let a_handle = a
        .scheduler
        .schedule(
            Schedule::builder("ticker").every(Duration::from_millis(30)).build(),
            counter.task(Duration::from_millis(1)),
        )
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || a_handle.is_owner()).await);

    let b = Node::start(&cluster, 32, fast_config()).await;
    let b_handle = b
        .scheduler
        .schedule(
            Schedule::builder("ticker").every(Duration::from_millis(30)).build(),
            counter.task(Duration::from_millis(1)),
        )
        .await
        .unwrap();

    a.session.expire_session();

    // Expiry is confirmed after the session timeout plus the margin.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(
        eventually(Duration::from_secs(2), || a_handle.is_owner() ^ b_handle.is_owner()).await
    );
    let runs = counter.runs();
    assert!(eventually(Duration::from_secs(2), || counter.runs() > runs + 2).await);
    assert!(a_handle.is_owner() ^ b_handle.is_owner());
    assert!(cluster.node_exists("/clustered_singleton/ticker/booking"));
    // A came back under a new session and re-registered.
    assert!(cluster.node_exists("/clustered_singleton/weight/127.0.0.1:31"));

    a.scheduler.close().await.unwrap();
    b.scheduler.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_weight_balancing_spreads_tasks() {
    let cluster = InMemoryCoordinationStore::default();
    let config = SchedulerConfig {
        weight_balance_period_ms: 100,
        weight_tolerance: 0,
        steal_grace_ms: 300,
        ..fast_config()
    };
    let names = ["t1", "t2", "t3", "t4"];

    let counters: Vec<OverlapCounter> = names.iter().map(|_| OverlapCounter::default()).collect();

    let a = Node::start(&cluster, 41, config.clone()).await;
    let mut a_handles = Vec::new();
    for (name, counter) in names.iter().zip(&counters) {
        a_handles.push(
            a.scheduler
                .schedule(
                    Schedule::builder(*name).every(Duration::from_millis(50)).build(),
                    counter.task(Duration::from_millis(10)),
                )
                .await
                .unwrap(),
        );
    }
    assert!(
        eventually(Duration::from_secs(1), || a_handles.iter().all(|h| h.is_owner())).await
    );

    let b = Node::start(&cluster, 42, config).await;
    let mut b_handles = Vec::new();
    for (name, counter) in names.iter().zip(&counters) {
        b_handles.push(
            b.scheduler
                .schedule(
                    Schedule::builder(*name).every(Duration::from_millis(50)).build(),
                    counter.task(Duration::from_millis(10)),
                )
                .await
                .unwrap(),
        );
    }

    let owned = |handles: &[clustered_singleton::TaskHandle]| {
        handles.iter().filter(|h| h.is_owner()).count()
    };
    assert!(
        eventually(Duration::from_secs(10), || {
            let (a_owned, b_owned) = (owned(&a_handles), owned(&b_handles));
            a_owned >= 1 && b_owned >= 1 && a_owned + b_owned == names.len()
        })
        .await
    );
    // Every task has exactly one owner.
    for (a_handle, b_handle) in a_handles.iter().zip(&b_handles) {
        assert!(!(a_handle.is_owner() && b_handle.is_owner()));
    }

    // Keep running across further balance rounds; no hand-off may overlap.
    let runs: Vec<u32> = counters.iter().map(OverlapCounter::runs).collect();
    assert!(
        eventually(Duration::from_secs(3), || counters
            .iter()
            .zip(&runs)
            .all(|(counter, before)| counter.runs() > before + 3))
        .await
    );
    for counter in &counters {
        assert_eq!(counter.overlaps(), 0);
    }

    a.scheduler.close().await.unwrap();
    b.scheduler.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_step_copies_run_together_on_the_owner() {
    let cluster = InMemoryCoordinationStore::default();
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for port in [51, 52] {
        let node = Node::start(&cluster, port, fast_config()).await;
        let mut pair = Vec::new();
        for _ in 0..2 {
            pair.push(
                node.scheduler
                    .schedule(
                        Schedule::builder("sync")
                            .every(Duration::from_millis(40))
                            .in_lock_step()
                            .build(),
                        counting_task(Arc::new(AtomicU32::new(0))),
                    )
                    .await
                    .unwrap(),
            );
        }
        handles.push(pair);
        nodes.push(node);
    }

    assert!(
        eventually(Duration::from_secs(3), || handles
            .iter()
            .any(|pair| pair.iter().all(|h| h.completed_runs() >= 2)))
        .await
    );
    let owner = handles
        .iter()
        .position(|pair| pair.iter().all(|h| h.is_owner()))
        .unwrap();
    for h in &handles[1 - owner] {
        assert_eq!(h.completed_runs(), 0);
        assert!(!h.is_owner());
    }

    for node in &nodes {
        node.scheduler.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_owner_hands_task_to_peer() {
    let cluster = InMemoryCoordinationStore::default();
    let a_runs = Arc::new(AtomicU32::new(0));
    let b_runs = Arc::new(AtomicU32::new(0));

    let a = Node::start(&cluster, 61, fast_config()).await;
    let a_handle = a
        .scheduler
        .schedule(
            Schedule::builder("job").every(Duration::from_millis(30)).build(),
            counting_task(a_runs.clone()),
        )
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || a_handle.is_owner()).await);

    let b = Node::start(&cluster, 62, fast_config()).await;
    let b_handle = b
        .scheduler
        .schedule(
            Schedule::builder("job").every(Duration::from_millis(30)).build(),
            counting_task(b_runs.clone()),
        )
        .await
        .unwrap();

    a_handle.cancel(false);
    assert!(eventually(Duration::from_secs(2), || a_handle.is_done()).await);
    let a_final = a_runs.load(Ordering::SeqCst);

    assert!(eventually(Duration::from_secs(2), || b_runs.load(Ordering::SeqCst) > 0).await);
    assert!(b_handle.is_owner());
    assert_eq!(
        b.scheduler.get_current_task_owner("job").await,
        Some(b.endpoint())
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a_runs.load(Ordering::SeqCst), a_final);

    a.scheduler.close().await.unwrap();
    b.scheduler.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_done_markers_are_scoped_to_service_version() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "service_version = \"2.0.0\"").unwrap();
    writeln!(file, "expiry_check_interval_ms = 20").unwrap();
    let v2 = SchedulerConfig::load(Some(file.path().to_str().unwrap())).unwrap();
    assert_eq!(v2.service_version, "2.0.0");
    assert_eq!(v2.expiry_check_interval_ms, 20);

    let cluster = InMemoryCoordinationStore::default();
    let v2_runs = Arc::new(AtomicU32::new(0));
    let node = Node::start(&cluster, 71, v2.clone()).await;
    let handle = node
        .scheduler
        .schedule(
            Schedule::builder("migrate").run_once().build(),
            counting_task(v2_runs.clone()),
        )
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || handle.is_done()).await);
    node.scheduler.close().await.unwrap();
    assert!(cluster.node_exists("/clustered_singleton/done/2.0.0/migrate"));

    let v3_runs = Arc::new(AtomicU32::new(0));
    let v3 = SchedulerConfig {
        service_version: "3.0.0".to_string(),
        ..v2
    };
    let node = Node::start(&cluster, 72, v3).await;
    let handle = node
        .scheduler
        .schedule(
            Schedule::builder("migrate").run_once().build(),
            counting_task(v3_runs.clone()),
        )
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(2), || handle.is_done()).await);
    node.scheduler.close().await.unwrap();

    assert_eq!(v2_runs.load(Ordering::SeqCst), 1);
    assert_eq!(v3_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_disconnects_during_a_run_keep_one_shot_single() {
    let cluster = InMemoryCoordinationStore::new(Duration::from_millis(300));
    let counter = OverlapCounter::default();

    let a = Node::start(&cluster, 81, fast_config()).await;
    let a_handle = a
        .scheduler
        .schedule(
            Schedule::builder("backfill").run_once().build(),
            counter.task(Duration::from_millis(800)),
        )
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || counter.in_flight() == 1).await);
    assert!(a_handle.is_owner());

    let b = Node::start(&cluster, 82, fast_config()).await;
    let b_handle = b
        .scheduler
        .schedule(
            Schedule::builder("backfill").run_once().build(),
            counter.task(Duration::from_millis(800)),
        )
        .await
        .unwrap();

    // Each pair stays well inside the session timeout.
    for _ in 0..4 {
        a.session.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.session.reconnect();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(eventually(Duration::from_secs(3), || a_handle.is_done()).await);
    assert!(eventually(Duration::from_secs(3), || b_handle.is_done()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.runs(), 1);
    assert_eq!(counter.overlaps(), 0);
    assert!(cluster.node_exists("/clustered_singleton/done/1.0.0/backfill"));

    a.scheduler.close().await.unwrap();
    b.scheduler.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_killed_owner_is_replaced_by_exactly_one_survivor() {
    let cluster = InMemoryCoordinationStore::default();
    let config = SchedulerConfig {
        expiry_check_interval_ms: 100,
        session_defer_margin_ms: 400,
        ..fast_config()
    };
    let takeover_bound = config.expiry_check_interval() + config.session_defer_margin();
    let counter = OverlapCounter::default();
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for port in 91..=93 {
        let node = Node::start(&cluster, port, config.clone()).await;
        handles.push(
            node.scheduler
                .schedule(
                    Schedule::builder("rollup").every(Duration::from_millis(40)).build(),
                    counter.task(Duration::from_millis(15)),
                )
                .await
                .unwrap(),
        );
        nodes.push(node);
    }

    let owners = |handles: &[clustered_singleton::TaskHandle]| {
        handles.iter().filter(|h| h.is_owner()).count()
    };
    assert!(eventually(Duration::from_secs(2), || owners(&handles) == 1 && counter.runs() > 0).await);
    let owner = handles.iter().position(|h| h.is_owner()).unwrap();
    nodes[owner].session.kill();

    let survivors: Vec<_> = handles
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != owner)
        .map(|(_, h)| h.clone())
        .collect();
    assert!(eventually(takeover_bound, || owners(&survivors) == 1).await);

    let runs = counter.runs();
    assert!(eventually(Duration::from_secs(2), || counter.runs() > runs + 3).await);
    assert_eq!(owners(&survivors), 1);
    assert_eq!(counter.overlaps(), 0);

    let new_owner = survivors.iter().position(|h| h.is_owner()).unwrap();
    let expected = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != owner)
        .nth(new_owner)
        .map(|(_, node)| node.endpoint());
    for (i, node) in nodes.iter().enumerate() {
        if i != owner {
            assert_eq!(node.scheduler.get_current_task_owner("rollup").await, expected);
        }
    }

    for (i, node) in nodes.iter().enumerate() {
        if i != owner {
            node.scheduler.close().await.unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plain_task_named_like_a_lock_step_copy_stays_exclusive() {
    let cluster = InMemoryCoordinationStore::default();
    let plain = OverlapCounter::default();

    let a = Node::start(&cluster, 101, fast_config()).await;
    for _ in 0..2 {
        a.scheduler
            .schedule(
                Schedule::builder("sync")
                    .every(Duration::from_millis(40))
                    .in_lock_step()
                    .build(),
                counting_task(Arc::new(AtomicU32::new(0))),
            )
            .await
            .unwrap();
    }
    let a_plain = a
        .scheduler
        .schedule(
            Schedule::builder("sync_1").every(Duration::from_millis(25)).build(),
            plain.task(Duration::from_millis(15)),
        )
        .await
        .unwrap();

    let b = Node::start(&cluster, 102, fast_config()).await;
    let b_plain = b
        .scheduler
        .schedule(
            Schedule::builder("sync_1").every(Duration::from_millis(25)).build(),
            plain.task(Duration::from_millis(15)),
        )
        .await
        .unwrap();
    assert_eq!(a_plain.task_name(), "sync_1");
    assert_eq!(b_plain.task_name(), "sync_1");

    assert!(eventually(Duration::from_secs(3), || plain.runs() >= 10).await);
    assert_eq!(plain.overlaps(), 0);
    assert!(a_plain.is_owner() ^ b_plain.is_owner());

    let owner = a.scheduler.get_current_task_owner("sync_1").await;
    assert!(owner.is_some());
    assert_eq!(b.scheduler.get_current_task_owner("sync_1").await, owner);
    assert_eq!(
        a.scheduler.get_current_task_owner("sync").await,
        Some(a.endpoint())
    );

    a.scheduler.close().await.unwrap();
    b.scheduler.close().await.unwrap();
}
