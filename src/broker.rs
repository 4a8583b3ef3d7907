// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The `Broker` trait is the set of low-level channel operations the messaging core needs.
//! [`crate::channel::AmqpBroker`] implements it on top of lapin; tests substitute an
//! in-memory or mocked broker.

use crate::{
    errors::{ConnectionError, ConsumeError, PublishError, TopologyError},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header carrying the broker-side delay for delayed-message exchanges
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// Header carrying the consumer-loop retry bookkeeping
pub const RETRY_COUNT_HEADER: &str = "retryCount";
/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A header or argument value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::String(v) => v.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// A message ready to be written to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutgoingMessage {
    /// Target exchange; empty string routes directly to the queue named by `routing_key`
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub message_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: Option<u8>,
    pub persistent: bool,
}

impl OutgoingMessage {
    pub fn delay_ms(&self) -> Option<i64> {
        self.headers.get(AMQP_HEADERS_DELAY).and_then(HeaderValue::as_i64)
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub headers: Headers,
    pub message_type: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: Option<u8>,
    /// Connection generation the delivery arrived on. Delivery tags are channel-scoped, so
    /// a delivery can only be settled while this generation is still the live one.
    pub session: u64,
}

impl Delivery {
    /// Number of retry cycles this message already went through, read from the
    /// `retryCount` header. Missing or unreadable headers count as zero.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(HeaderValue::as_i64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or_default()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, ConsumeError>>;

/// Low-level channel operations. Implementations serialize these on their channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens the connection and channel, replacing any previous session.
    async fn connect(&self) -> Result<(), ConnectionError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TopologyError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), TopologyError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TopologyError>;

    /// Writes a message; resolves once the broker accepted it for routing.
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), PublishError>;

    async fn qos(&self, prefetch: u16) -> Result<(), ConsumeError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, ConsumeError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumeError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ConsumeError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConsumeError>;

    async fn close_channel(&self) -> Result<(), ConnectionError>;

    async fn close_connection(&self) -> Result<(), ConnectionError>;
}
