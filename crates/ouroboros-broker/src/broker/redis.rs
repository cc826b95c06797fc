//! Redis broker implementation
//!
//! Immediate tasks live in a list per routing key. Delayed tasks share one
//! sorted set scored by their ETA in nanoseconds, polled by every consumer
//! and claimed with WATCH/MULTI/EXEC so each one is delivered once.
//!
//! A consumption session runs two loops feeding the worker pool: one
//! blocking-pops the default queue, the other claims due delayed tasks.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::core::Verdict;
use super::{claim_due, Broker, BrokerCore, TaskProcessor, WorkerPool};
use crate::{BrokerConfig, RedisEndpoint, Signature, TaskError};

/// Connections held for the lifetime of a session by the two loops
const LOOP_CONNECTIONS: usize = 2;

/// Entries returned by a pending-tasks query
const PENDING_LIMIT: isize = 10;

type Delivery = Result<Vec<u8>, TaskError>;

/// Redis broker
pub struct RedisBroker {
    core: BrokerCore,
    endpoint: RedisEndpoint,
    pool: Pool,
    loops: Mutex<Option<TaskTracker>>,
}

impl RedisBroker {
    /// Create a broker for `endpoint`. No connection is made until the
    /// first command.
    pub fn new(config: BrokerConfig, endpoint: RedisEndpoint) -> Result<Self, TaskError> {
        let pool = PoolConfig::from_url(endpoint.connection_url())
            .builder()
            .map_err(|e| TaskError::Configuration(format!("Failed to create pool builder: {}", e)))?
            .max_size(config.redis.max_idle.max(1) + LOOP_CONNECTIONS)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| TaskError::Configuration(format!("Failed to create pool: {}", e)))?;

        let default_queue = config.default_queue.clone();
        Ok(Self {
            core: BrokerCore::new(config, default_queue),
            endpoint,
            pool,
            loops: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &RedisEndpoint {
        &self.endpoint
    }

    async fn get_conn(&self) -> Result<Connection, TaskError> {
        get_conn(&self.pool).await
    }

    async fn ping(&self) -> Result<(), TaskError> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn consume(
        &self,
        consumer_tag: &str,
        processor: Arc<dyn TaskProcessor>,
        stop: CancellationToken,
    ) -> Result<(), TaskError> {
        if stop.is_cancelled() {
            return Ok(());
        }

        if let Err(e) = self.ping().await {
            self.core.connection_failed();
            return Err(e);
        }
        self.core.connection_established();
        reap_idle(&self.pool, self.core.config().redis.idle_timeout);

        let config = self.core.config();
        let queue = config.default_queue.clone();
        let loops = stop.child_token();
        let tracker = TaskTracker::new();
        let (tx, mut rx) = mpsc::channel::<Delivery>(1);

        tracker.spawn(receive_loop(
            self.pool.clone(),
            queue.clone(),
            config.redis.pop_timeout,
            tx.clone(),
            loops.clone(),
        ));
        tracker.spawn(delayed_loop(
            self.pool.clone(),
            config.redis.delayed_tasks_key.clone(),
            queue.clone(),
            config.redis.poll_interval,
            tx,
            loops.clone(),
        ));
        tracker.spawn(reap_loop(
            self.pool.clone(),
            config.redis.idle_timeout,
            loops.clone(),
        ));
        tracker.close();
        *self.loops.lock() = Some(tracker.clone());

        tracing::info!(consumer_tag, queue = %queue, "Waiting for messages");

        let deliveries = futures::stream::poll_fn(|cx| rx.poll_recv(cx));
        let pool = WorkerPool::new(config.max_worker_instances, stop);
        let result = pool
            .run(deliveries, |payload: Vec<u8>| {
                let verdict = self.core.classify(&payload);
                let redis = self.pool.clone();
                let queue = queue.clone();
                let processor = processor.clone();
                async move { handle_delivery(payload, verdict, redis, queue, processor).await }
            })
            .await;

        loops.cancel();
        tracker.wait().await;
        self.loops.lock().take();

        // Popped from the store but never admitted to a worker
        let leftovers = drain_undelivered(&mut rx);
        if !leftovers.is_empty() {
            if let Err(e) = requeue_front(&self.pool, &queue, leftovers).await {
                tracing::error!(queue = %queue, error = %e, "Failed to requeue undelivered tasks");
            }
        }

        result
    }
}

async fn handle_delivery(
    payload: Vec<u8>,
    verdict: Verdict,
    pool: Pool,
    queue: String,
    processor: Arc<dyn TaskProcessor>,
) -> Result<(), TaskError> {
    match disposition(verdict) {
        Disposition::Drop(reason) => {
            tracing::warn!(reason = %reason, "Dropping undecodable message");
            Ok(())
        }
        Disposition::HandBack(signature) => {
            tracing::debug!(
                task_name = %signature.name,
                task_uuid = %signature.uuid,
                queue = %queue,
                "Task not registered with this consumer, requeueing"
            );
            let mut conn = get_conn(&pool).await?;
            let _: () = conn.rpush(&queue, payload).await?;
            Ok(())
        }
        Disposition::Process(signature) => {
            tracing::debug!(
                task_name = %signature.name,
                task_uuid = %signature.uuid,
                "Received task"
            );
            processor.process(signature).await
        }
    }
}

/// What happens to a popped payload before any processing
#[derive(Debug)]
enum Disposition {
    /// Logged and discarded; consumption continues
    Drop(String),
    /// Pushed back to the tail of the queue for another consumer
    HandBack(Signature),
    Process(Signature),
}

fn disposition(verdict: Verdict) -> Disposition {
    match verdict {
        Verdict::Empty => Disposition::Drop("empty message".to_string()),
        Verdict::Malformed(e) => Disposition::Drop(e.to_string()),
        Verdict::Unregistered(signature) => Disposition::HandBack(signature),
        Verdict::Process(signature) => Disposition::Process(signature),
    }
}

async fn get_conn(pool: &Pool) -> Result<Connection, TaskError> {
    pool.get()
        .await
        .map_err(|e| TaskError::Connection(format!("Failed to get connection: {}", e)))
}

/// Push payloads back onto the head of `queue`; the last element ends up first
async fn requeue_front(
    pool: &Pool,
    queue: &str,
    payloads: Vec<Vec<u8>>,
) -> Result<(), TaskError> {
    let count = payloads.len();
    let mut conn = get_conn(pool).await?;
    let _: () = conn.lpush(queue, payloads).await?;
    tracing::info!(queue, count, "Requeued undelivered tasks");
    Ok(())
}

/// Queue a popped payload for the worker pool. The payload comes back if
/// the session winds down before there is room for it.
async fn hand_off(
    tx: &mpsc::Sender<Delivery>,
    cancel: &CancellationToken,
    payload: Vec<u8>,
) -> Result<(), Vec<u8>> {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = tx.reserve() => permit.ok(),
    };

    match permit {
        Some(permit) => {
            permit.send(Ok(payload));
            Ok(())
        }
        None => Err(payload),
    }
}

/// Hand a popped payload to the worker pool, or put it back at the head of
/// `queue` if the session is winding down.
async fn forward(
    pool: &Pool,
    queue: &str,
    tx: &mpsc::Sender<Delivery>,
    cancel: &CancellationToken,
    payload: Vec<u8>,
) {
    if let Err(payload) = hand_off(tx, cancel, payload).await {
        if let Err(e) = requeue_front(pool, queue, vec![payload]).await {
            tracing::error!(queue, error = %e, "Failed to requeue undelivered task");
        }
    }
}

/// Take every payload still waiting in the channel, ordered for LPUSH so
/// the queue head ends up in the original order.
fn drain_undelivered(rx: &mut mpsc::Receiver<Delivery>) -> Vec<Vec<u8>> {
    let mut leftovers = Vec::new();
    while let Ok(delivery) = rx.try_recv() {
        if let Ok(payload) = delivery {
            leftovers.push(payload);
        }
    }
    leftovers.reverse();
    leftovers
}

/// Report a fatal loop error to the worker pool
async fn fail(tx: &mpsc::Sender<Delivery>, cancel: &CancellationToken, error: TaskError) {
    tracing::error!(error = %error, "Redis consumption loop failed");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = tx.send(Err(error)) => {}
    }
}

async fn pop_next(
    pool: &Pool,
    queue: &str,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, TaskError> {
    let mut conn = get_conn(pool).await?;
    let popped: Option<(String, Vec<u8>)> = conn.blpop(queue, timeout.as_secs_f64()).await?;
    Ok(popped.map(|(_, payload)| payload))
}

/// Blocking-pop the default queue until cancelled.
///
/// A pop is never abandoned midway, so stopping takes up to one pop timeout.
async fn receive_loop(
    pool: Pool,
    queue: String,
    timeout: Duration,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        match pop_next(&pool, &queue, timeout).await {
            Ok(Some(payload)) => forward(&pool, &queue, &tx, &cancel, payload).await,
            Ok(None) => tracing::trace!(queue = %queue, "Pop timed out"),
            Err(e) => return fail(&tx, &cancel, e).await,
        }
    }
}

async fn claim_next(pool: &Pool, key: &str) -> Result<Option<Vec<u8>>, TaskError> {
    let mut conn = get_conn(pool).await?;
    let claimed = claim_due(&mut conn, key, now_nanos).await;
    if claimed.is_err() {
        // Leave no dangling WATCH on a pooled connection
        let _ = redis::cmd("UNWATCH").query_async::<()>(&mut conn).await;
    }
    claimed
}

/// Poll the delayed set every `interval` and forward due tasks
async fn delayed_loop(
    pool: Pool,
    key: String,
    queue: String,
    interval: Duration,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match claim_next(&pool, &key).await {
            Ok(Some(payload)) => {
                tracing::debug!(key = %key, "Claimed delayed task");
                forward(&pool, &queue, &tx, &cancel, payload).await;
            }
            Ok(None) => {}
            Err(e) => return fail(&tx, &cancel, e).await,
        }
    }
}

/// Drop pooled connections unused for longer than `idle_timeout`
fn reap_idle(pool: &Pool, idle_timeout: Duration) {
    let before = pool.status().size;
    pool.retain(|_, metrics| metrics.last_used() < idle_timeout);
    let after = pool.status().size;
    if after < before {
        tracing::debug!(removed = before - after, "Dropped idle Redis connections");
    }
}

async fn reap_loop(pool: Pool, idle_timeout: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(idle_timeout.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => reap_idle(&pool, idle_timeout),
        }
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), TaskError> {
        let stop = self.core.begin_consuming();
        let result = self.consume(consumer_tag, processor, stop).await;
        self.core.finish_consuming();

        match &result {
            Ok(()) => tracing::info!(consumer_tag, "Consumer stopped"),
            Err(e) => tracing::error!(consumer_tag, error = %e, "Consumption failed"),
        }
        result
    }

    async fn stop_consuming(&self) {
        self.core.stop_consuming();

        let loops = self.loops.lock().clone();
        if let Some(tracker) = loops {
            tracker.wait().await;
        }
    }

    async fn publish(&self, mut signature: Signature) -> Result<(), TaskError> {
        self.core.adjust_routing_key(&mut signature);
        let payload = signature.encode()?;
        let mut conn = self.get_conn().await?;

        match signature.eta.filter(|eta| *eta > Utc::now()) {
            Some(eta) => {
                let score = eta.timestamp_nanos_opt().ok_or_else(|| {
                    TaskError::Serialization(format!("ETA out of range: {}", eta))
                })?;
                let key = &self.core.config().redis.delayed_tasks_key;
                let _: () = conn.zadd(key, payload, score).await?;
                tracing::debug!(
                    task_name = %signature.name,
                    task_uuid = %signature.uuid,
                    eta = %eta,
                    "Published delayed task"
                );
            }
            None => {
                let _: () = conn.rpush(&signature.routing_key, payload).await?;
                tracing::debug!(
                    task_name = %signature.name,
                    task_uuid = %signature.uuid,
                    queue = %signature.routing_key,
                    "Published task"
                );
            }
        }
        Ok(())
    }

    async fn get_pending_tasks(&self, queue: &str) -> Result<Vec<Signature>, TaskError> {
        let queue = if queue.is_empty() {
            self.core.config().default_queue.as_str()
        } else {
            queue
        };

        let mut conn = self.get_conn().await?;
        let items: Vec<Vec<u8>> = conn.lrange(queue, 0, PENDING_LIMIT - 1).await?;
        items.iter().map(|item| Signature::decode(item)).collect()
    }

    fn core(&self) -> &BrokerCore {
        &self.core
    }
}
