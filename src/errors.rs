// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Core
//!
//! One error enum per failure domain. Topology errors are fatal at startup, publish and
//! consume errors are surfaced to the caller, and processing errors carry the retry
//! classification that drives the consumer's ack/retry/dead-letter decision.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while declaring exchanges, queues and bindings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// An entity with the same name already exists with different parameters
    #[error("conflicting declaration for {entity} `{name}`")]
    Conflict { entity: &'static str, name: String },

    /// The broker refused to declare an exchange or queue
    #[error("failure to declare {entity} `{name}`: {reason}")]
    Declare {
        entity: &'static str,
        name: String,
        reason: String,
    },

    /// The broker refused to bind a queue to an exchange
    #[error("failure to bind exchange `{exchange}` to queue `{queue}`: {reason}")]
    Binding {
        exchange: String,
        queue: String,
        reason: String,
    },

    #[error("no open channel to declare topology on")]
    NotConnected,
}

/// Errors surfaced to producers when a message could not be handed to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("no open channel to publish on")]
    NotConnected,

    #[error("failure to encode envelope: {0}")]
    Encode(String),

    /// The broker rejected the publish frame
    #[error("failure to publish to `{exchange}`: {reason}")]
    Rejected { exchange: String, reason: String },

    /// Publisher confirms are enabled and the broker nacked the message
    #[error("broker nacked message published to `{0}`")]
    Nacked(String),

    /// A delayed publish targeted an exchange that cannot delay messages
    #[error("exchange `{0}` is not a delayed-message exchange")]
    NotDelayed(String),

    /// The channel or connection closed under the publish
    #[error("connection lost while publishing: {0}")]
    ConnectionLost(String),
}

impl PublishError {
    /// Whether the failure means the session is gone and a reconnect is needed.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, PublishError::NotConnected | PublishError::ConnectionLost(_))
    }
}

/// Errors raised by subscription and acknowledgement operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    #[error("no open channel to consume on")]
    NotConnected,

    #[error("failure to configure qos `{0}`")]
    Qos(String),

    #[error("failure to declare consumer on queue `{queue}`: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("failure to ack message `{0}`")]
    Ack(String),

    #[error("failure to nack message `{0}`")]
    Nack(String),

    #[error("failure to cancel consumer `{0}`")]
    Cancel(String),

    #[error("delivery stream error `{0}`")]
    Stream(String),
}

/// Connection lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("failure to connect: {0}")]
    Connect(String),

    #[error("failure to create a channel: {0}")]
    Channel(String),

    #[error("failure to close: {0}")]
    Close(String),

    /// The reconnection loop ran out of attempts; the client is left degraded
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("connection manager is shutting down")]
    ShuttingDown,
}

/// Outcome of a failed handler invocation.
///
/// The variant is the retry decision: retryable failures are rescheduled with backoff,
/// terminal failures are rejected without requeue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Transient failure (connectivity, unavailable dependency)
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// Validation or business-rule failure; retrying will not help
    #[error("terminal failure: {0}")]
    Terminal(String),

    #[error("handler timed out after {0}ms")]
    Timeout(u64),

    /// The message body is not a valid envelope
    #[error("failure to decode envelope: {0}")]
    Decode(String),

    /// The envelope payload does not match the handler's payload type
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported message type `{0}`")]
    UnsupportedType(String),

    /// In-process work was interrupted by shutdown
    #[error("processing cancelled")]
    Cancelled,
}

impl ProcessingError {
    pub fn retryable(reason: impl ToString) -> Self {
        ProcessingError::Retryable(reason.to_string())
    }

    pub fn terminal(reason: impl ToString) -> Self {
        ProcessingError::Terminal(reason.to_string())
    }

    /// Whether the failure may succeed if the message is delivered again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessingError::Retryable(_) | ProcessingError::Timeout(_) | ProcessingError::Decode(_)
        )
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::InvalidPayload(err.to_string())
    }
}

impl From<TaskError> for ProcessingError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::TimedOut(limit) => ProcessingError::Timeout(limit.as_millis() as u64),
            TaskError::Cancelled => ProcessingError::Cancelled,
        }
    }
}

/// Errors from scheduled work run under a [`crate::task::TaskScope`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    #[error("task cancelled")]
    Cancelled,
}

/// Errors raised by the worker service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("no worker registered for queue `{0}`")]
    NotRegistered(String),

    #[error(transparent)]
    Consume(#[from] ConsumeError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Aggregate error for callers that drive the whole client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_failures() {
        assert!(ProcessingError::retryable("db down").is_retryable());
        assert!(ProcessingError::Timeout(500).is_retryable());
        assert!(ProcessingError::Decode("eof".into()).is_retryable());

        assert!(!ProcessingError::terminal("bad email").is_retryable());
        assert!(!ProcessingError::InvalidPayload("missing field".into()).is_retryable());
        assert!(!ProcessingError::UnsupportedType("x".into()).is_retryable());
        assert!(!ProcessingError::Cancelled.is_retryable());
    }

    #[test]
    fn task_errors_map_to_processing_errors() {
        let timed_out: ProcessingError = TaskError::TimedOut(Duration::from_millis(1500)).into();
        assert_eq!(timed_out, ProcessingError::Timeout(1500));

        let cancelled: ProcessingError = TaskError::Cancelled.into();
        assert_eq!(cancelled, ProcessingError::Cancelled);
    }

    #[test]
    fn only_session_failures_count_as_connection_loss() {
        assert!(PublishError::NotConnected.is_connection_loss());
        assert!(PublishError::ConnectionLost("channel closed".into()).is_connection_loss());

        assert!(!PublishError::Nacked("orders".into()).is_connection_loss());
        assert!(!PublishError::NotDelayed("orders".into()).is_connection_loss());
        assert!(!PublishError::Rejected {
            exchange: "orders".into(),
            reason: "NOT_FOUND".into(),
        }
        .is_connection_loss());
    }
}
