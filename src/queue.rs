// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types for defining RabbitMQ queues and their bindings to exchanges, including the
//! dead-letter arguments the consumer relies on to capture messages that exhausted
//! their retries.

use crate::broker::{HeaderValue, Headers};
use serde::{Deserialize, Serialize};

/// Argument naming the exchange that receives rejected or expired messages
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Argument overriding the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Argument for the per-queue message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Argument for the maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Argument for the maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// A queue without a dead-letter exchange silently drops messages that are rejected
/// without requeue, which is how the consumer settles messages that ran out of retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,
    #[serde(default)]
    pub message_ttl: Option<i64>,
    #[serde(default)]
    pub max_length: Option<i64>,
    #[serde(default)]
    pub max_length_bytes: Option<i64>,
    #[serde(default)]
    pub arguments: Headers,
}

fn default_durable() -> bool {
    true
}

impl QueueDefinition {
    /// Creates a durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
            max_length: None,
            max_length_bytes: None,
            arguments: Headers::default(),
        }
    }

    /// Makes the queue transient: it does not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Routes rejected and expired messages to `exchange`.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Overrides the routing key used when a message is dead-lettered.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i64) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i64) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i64) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    pub fn has_dead_letter_exchange(&self) -> bool {
        self.dead_letter_exchange.is_some()
            || self.arguments.contains_key(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
    }

    /// The `x-*` arguments sent with the declaration.
    pub fn declare_arguments(&self) -> Headers {
        let mut args = self.arguments.clone();

        if let Some(dlx) = &self.dead_letter_exchange {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::from(dlx.as_str()),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::from(key.as_str()),
            );
        }

        if let Some(ttl) = self.message_ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::Int(ttl));
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::Int(max));
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::Int(max_bytes),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with the
    /// `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue: queue.to_owned(),
            exchange: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_arguments_include_dead_letter_settings() {
        let def = QueueDefinition::new("user_created_queue")
            .dead_letter_exchange("dlx")
            .dead_letter_routing_key("user.created.dead")
            .ttl(30_000)
            .max_length(100);

        let args = def.declare_arguments();

        assert!(def.has_dead_letter_exchange());
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&HeaderValue::from("dlx"))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("user.created.dead"))
        );
        assert_eq!(args.get(AMQP_HEADERS_MESSAGE_TTL), Some(&HeaderValue::Int(30_000)));
        assert_eq!(args.get(AMQP_HEADERS_MAX_LENGTH), Some(&HeaderValue::Int(100)));
        assert!(!args.contains_key(AMQP_HEADERS_MAX_LENGTH_BYTES));
    }

    #[test]
    fn raw_dead_letter_argument_counts_as_configured() {
        let def = QueueDefinition::new("q").argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, "dlx");
        assert!(def.has_dead_letter_exchange());
        assert!(!QueueDefinition::new("q").has_dead_letter_exchange());
    }

    #[test]
    fn deserializes_original_style_arguments() {
        let def: QueueDefinition = serde_json::from_str(
            r#"{
                "name": "user_retry_queue",
                "arguments": {
                    "x-dead-letter-exchange": "user_events",
                    "x-dead-letter-routing-key": "user.created"
                }
            }"#,
        )
        .unwrap();

        assert!(def.durable);
        assert!(def.has_dead_letter_exchange());
    }
}
