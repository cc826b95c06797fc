//! ouroboros-broker: Message brokers for the distributed task queue
//!
//! Producers publish task signatures; consumers pull them through a bounded
//! worker pool and hand them to a [`TaskProcessor`]. Two backends are
//! provided: AMQP (dead-letter TTL queues for delays) and Redis (a sorted
//! set of delayed tasks claimed under optimistic locking).

pub mod config;
pub mod error;
pub mod retry;
pub mod signature;

pub mod broker;

// Re-exports
pub use config::{
    AmqpConfig, BrokerConfig, BrokerKind, RedisAddr, RedisConfig, RedisEndpoint, TlsConfig,
};
pub use error::TaskError;
pub use retry::Backoff;
pub use signature::{Arg, Signature};

// Broker re-exports
pub use broker::{claim_due, Broker, BrokerCore, ClaimStore, TaskProcessor, WorkerPool};

#[cfg(feature = "amqp")]
pub use broker::AmqpBroker;

#[cfg(feature = "redis")]
pub use broker::RedisBroker;

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, TaskError>;
