//! Broker error types

use thiserror::Error;

/// Broker error types
#[derive(Error, Debug)]
pub enum TaskError {
    /// Dial, channel or pool checkout failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Exchange/queue declaration, binding, QoS or consume setup failure
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Received an empty message")]
    EmptyMessage,

    #[error("Cannot delay task by {0}ms")]
    InvalidDelay(i64),

    #[error("Publish rejected by broker: {0}")]
    PublishRejected(String),

    /// Failure reported by the task processor
    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Whether the error comes from the transport layer, so a supervisor may
    /// back off and relaunch consumption.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TaskError::Connection(_) | TaskError::Topology(_) | TaskError::Broker(_)
        )
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Serialization(err.to_string())
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for TaskError {
    fn from(err: lapin::Error) -> Self {
        TaskError::Broker(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for TaskError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            TaskError::Connection(err.to_string())
        } else {
            TaskError::Broker(err.to_string())
        }
    }
}
