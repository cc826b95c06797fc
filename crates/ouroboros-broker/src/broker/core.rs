//! State shared by every broker backend

use dashmap::DashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{Backoff, BrokerConfig, Signature, TaskError};

/// What to do with a raw delivery, decided before it reaches a worker
#[derive(Debug)]
pub(crate) enum Verdict {
    Empty,
    Malformed(TaskError),
    Unregistered(Signature),
    Process(Signature),
}

/// Cross-backend bookkeeping: registered task names, the shutdown signal
/// and the retry-eligibility flag.
pub struct BrokerCore {
    config: BrokerConfig,
    default_routing_key: String,
    registered: DashSet<String>,
    stop: Mutex<CancellationToken>,
    consuming: AtomicBool,
    retry: AtomicBool,
    backoff: Mutex<Backoff>,
    retry_after: Mutex<Option<Duration>>,
}

impl BrokerCore {
    /// Create core state; `default_routing_key` fills signatures published
    /// without a routing key.
    pub fn new(config: BrokerConfig, default_routing_key: impl Into<String>) -> Self {
        let backoff = Backoff::new(config.max_retry_delay);
        Self {
            config,
            default_routing_key: default_routing_key.into(),
            registered: DashSet::new(),
            stop: Mutex::new(CancellationToken::new()),
            consuming: AtomicBool::new(false),
            retry: AtomicBool::new(true),
            backoff: Mutex::new(backoff),
            retry_after: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Replace the set of task names this consumer can process
    pub fn set_registered_task_names<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registered.clear();
        for name in names {
            self.registered.insert(name.into());
        }
    }

    /// Check whether this consumer can process `name`
    pub fn is_task_registered(&self, name: &str) -> bool {
        self.registered.contains(name)
    }

    /// Decode a delivery and check it against the registered names
    pub(crate) fn classify(&self, body: &[u8]) -> Verdict {
        if body.is_empty() {
            return Verdict::Empty;
        }

        match Signature::decode(body) {
            Ok(signature) if self.is_task_registered(&signature.name) => {
                Verdict::Process(signature)
            }
            Ok(signature) => Verdict::Unregistered(signature),
            Err(e) => Verdict::Malformed(e),
        }
    }

    /// Fill in the default routing key when the signature has none
    pub fn adjust_routing_key(&self, signature: &mut Signature) {
        if signature.routing_key.is_empty() {
            signature.routing_key = self.default_routing_key.clone();
        }
    }

    /// Mark the start of a consumption session and hand out its stop signal.
    ///
    /// A stop requested before this call is honoured: the returned token is
    /// already cancelled and the session ends immediately.
    pub fn begin_consuming(&self) -> CancellationToken {
        let stop = self.stop.lock();
        self.consuming.store(true, Ordering::SeqCst);
        if !stop.is_cancelled() {
            self.retry.store(true, Ordering::SeqCst);
        }
        stop.clone()
    }

    /// Mark the end of a consumption session; a spent stop signal is
    /// replaced so the broker can consume again.
    pub fn finish_consuming(&self) {
        self.consuming.store(false, Ordering::SeqCst);
        let mut stop = self.stop.lock();
        if stop.is_cancelled() {
            *stop = CancellationToken::new();
        }
    }

    /// Signal the running session (if any) to stop
    pub fn stop_consuming(&self) {
        let stop = self.stop.lock();
        self.retry.store(false, Ordering::SeqCst);
        stop.cancel();
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    /// Whether the caller should relaunch consumption after it returned
    pub fn retry(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    /// Suggested wait before relaunching after a connection failure
    pub fn retry_after(&self) -> Option<Duration> {
        *self.retry_after.lock()
    }

    pub(crate) fn connection_failed(&self) {
        let delay = self.backoff.lock().next_delay();
        tracing::warn!(retry_in_secs = delay.as_secs(), "Broker connection failed");
        *self.retry_after.lock() = Some(delay);
    }

    pub(crate) fn connection_established(&self) {
        self.backoff.lock().reset();
        *self.retry_after.lock() = None;
    }
}
