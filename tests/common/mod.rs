#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clustered_singleton::{
    task_fn, InMemoryCoordinationStore, InMemorySession, NodeEndpoint, SchedulerConfig,
    SingletonScheduler, SingletonTask,
};

pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        expiry_check_interval_ms: 20,
        cancel_check_interval_ms: 10,
        max_wait_time_post_cancel_ms: 2_000,
        session_defer_margin_ms: 50,
        ..SchedulerConfig::default()
    }
}

pub struct Node {
    pub scheduler: SingletonScheduler,
    pub session: Arc<InMemorySession>,
}

impl Node {
    pub async fn start(cluster: &InMemoryCoordinationStore, port: u16, config: SchedulerConfig) -> Self {
        let session = cluster.connect();
        let scheduler =
            SingletonScheduler::builder(session.clone(), NodeEndpoint::new("127.0.0.1", port))
                .config(config)
                .halt_handler(Arc::new(|_reason: &str| {}))
                .build()
                .unwrap();
        scheduler.start().await.unwrap();
        Self { scheduler, session }
    }

    pub fn endpoint(&self) -> NodeEndpoint {
        self.scheduler.endpoint().clone()
    }
}

/// Body that counts its runs and records whether two bodies ever overlapped.
#[derive(Clone, Default)]
pub struct OverlapCounter {
    pub in_flight: Arc<AtomicUsize>,
    pub overlaps: Arc<AtomicU32>,
    pub runs: Arc<AtomicU32>,
}

impl OverlapCounter {
    pub fn task(&self, body: Duration) -> Arc<dyn SingletonTask> {
        let counter = self.clone();
        task_fn(move || {
            let counter = counter.clone();
            async move {
                if counter.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    counter.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(body).await;
                counter.in_flight.fetch_sub(1, Ordering::SeqCst);
                counter.runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> u32 {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub fn counting_task(counter: Arc<AtomicU32>) -> Arc<dyn SingletonTask> {
    task_fn(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

/// Polls `condition` every 10ms for up to `limit`.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
