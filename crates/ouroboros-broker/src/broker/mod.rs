//! Message broker implementations
//!
//! Provides the [`Broker`] trait with AMQP and Redis backends. Both
//! compose a [`BrokerCore`] for shared bookkeeping and feed deliveries
//! through the same [`WorkerPool`].

mod claim;
mod core;
mod pool;

use async_trait::async_trait;
use std::sync::Arc;

use crate::{Signature, TaskError};

pub use self::claim::{claim_due, ClaimStore};
pub use self::core::BrokerCore;
pub use self::pool::WorkerPool;

/// Turns a decoded signature into a running task.
///
/// The broker only looks at whether processing failed; results are the
/// processor's concern.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    /// Process a single task
    async fn process(&self, signature: Signature) -> Result<(), TaskError>;
}

/// Trait for message broker implementations
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Consume tasks until stopped or a fatal error occurs.
    ///
    /// Check [`Broker::retry`] after this returns to decide whether to
    /// relaunch consumption.
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), TaskError>;

    /// Signal consumption to stop and wait for the session to wind down
    async fn stop_consuming(&self);

    /// Publish a task, immediately or at its ETA
    async fn publish(&self, signature: Signature) -> Result<(), TaskError>;

    /// Peek at up to 10 queued tasks without removing them; an empty name
    /// means the default queue.
    async fn get_pending_tasks(&self, queue: &str) -> Result<Vec<Signature>, TaskError>;

    /// Shared state (registered names, stop signal, retry flag)
    fn core(&self) -> &BrokerCore;

    /// Whether a supervisor should relaunch `start_consuming`
    fn retry(&self) -> bool {
        self.core().retry()
    }
}

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;
