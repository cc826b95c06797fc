//! Task signature - the unit of work carried through the broker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::TaskError;

/// A single typed positional argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    /// Optional argument name
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Primitive type tag (e.g. "int64", "string")
    #[serde(rename = "Type")]
    pub arg_type: String,
    /// Argument value, interpreted by the task processor
    #[serde(rename = "Value")]
    pub value: serde_json::Value,
}

impl Arg {
    /// Create an argument with an explicit type tag
    pub fn new(arg_type: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: None,
            arg_type: arg_type.into(),
            value: value.into(),
        }
    }

    pub fn int64(value: i64) -> Self {
        Self::new("int64", value)
    }

    pub fn float64(value: f64) -> Self {
        Self::new("float64", value)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new("string", value.into())
    }

    pub fn bool(value: bool) -> Self {
        Self::new("bool", value)
    }

    /// Set the argument name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Task signature sent through the broker.
///
/// Field names on the wire match the format used by existing workers
/// (`UUID`, `Name`, `RoutingKey`, `ETA`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Task identifier, stable across redeliveries
    #[serde(rename = "UUID", default)]
    pub uuid: String,
    /// Name of the task to execute
    #[serde(rename = "Name")]
    pub name: String,
    /// Queue/binding the message is delivered through
    #[serde(rename = "RoutingKey", default)]
    pub routing_key: String,
    /// Earliest delivery time (for delayed tasks)
    #[serde(rename = "ETA", default)]
    pub eta: Option<DateTime<Utc>>,
    /// Positional arguments, order preserved
    #[serde(rename = "Args", default)]
    pub args: Vec<Arg>,
    /// Opaque headers forwarded to transport metadata
    #[serde(rename = "Headers", default)]
    pub headers: HashMap<String, serde_json::Value>,
    /// Whether chained callbacks receive this task's result
    #[serde(rename = "Immutable", default)]
    pub immutable: bool,
    /// Number of retry attempts so far
    #[serde(rename = "RetryCount", default)]
    pub retry_count: u32,
}

impl Signature {
    /// Create a new signature with a fresh UUID
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: format!("task_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            routing_key: String::new(),
            eta: None,
            args: Vec::new(),
            headers: HashMap::new(),
            immutable: false,
            retry_count: 0,
        }
    }

    /// Append a positional argument
    pub fn with_arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    /// Replace all positional arguments
    pub fn with_args(mut self, args: Vec<Arg>) -> Self {
        self.args = args;
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Set ETA for delayed delivery
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Remaining delay relative to `now`, if the ETA lies in the future
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.eta.filter(|eta| *eta > now).map(|eta| eta - now)
    }

    /// Serialize to the JSON wire format
    pub fn encode(&self) -> Result<Vec<u8>, TaskError> {
        if self.name.is_empty() {
            return Err(TaskError::Serialization("task name must not be empty".to_string()));
        }
        serde_json::to_vec(self)
            .map_err(|e| TaskError::Serialization(format!("JSON marshal error: {}", e)))
    }

    /// Parse from the JSON wire format
    pub fn decode(bytes: &[u8]) -> Result<Self, TaskError> {
        let signature: Self = serde_json::from_slice(bytes)
            .map_err(|e| TaskError::Deserialization(format!("JSON unmarshal error: {}", e)))?;
        if signature.name.is_empty() {
            return Err(TaskError::Deserialization("task name must not be empty".to_string()));
        }
        Ok(signature)
    }
}
