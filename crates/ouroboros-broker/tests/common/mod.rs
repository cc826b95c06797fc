//! Shared helpers for live-broker integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use ouroboros_broker::{Broker, Signature, TaskError, TaskProcessor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Processor that records what it saw and how many ran at once
pub struct Recorder {
    work: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
    processed: Mutex<Vec<(Signature, Instant)>>,
}

impl Recorder {
    pub fn new(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            processed: Mutex::new(Vec::new()),
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.processed.lock().len()
    }

    pub fn processed(&self) -> Vec<(Signature, Instant)> {
        self.processed.lock().clone()
    }

    pub fn uuids(&self) -> Vec<String> {
        self.processed
            .lock()
            .iter()
            .map(|(sig, _)| sig.uuid.clone())
            .collect()
    }

    /// Wait until at least `n` tasks finished
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.count() >= n).await
    }
}

#[async_trait]
impl TaskProcessor for Recorder {
    async fn process(&self, signature: Signature) -> Result<(), TaskError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }

        self.processed.lock().push((signature, Instant::now()));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Run `start_consuming` in the background
pub fn spawn_consumer<B: Broker>(
    broker: Arc<B>,
    tag: &str,
    processor: Arc<Recorder>,
) -> JoinHandle<Result<(), TaskError>> {
    let tag = tag.to_string();
    tokio::spawn(async move {
        let processor: Arc<dyn TaskProcessor> = processor;
        broker.start_consuming(&tag, processor).await
    })
}

/// Names unique to one test run
pub fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
