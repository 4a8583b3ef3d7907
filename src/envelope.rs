// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The JSON wrapper carried in every published message body:
//!
//! ```json
//! {
//!   "id": "1718000000000-k3j9x0a1b2c3d",
//!   "type": "user_cleanup",
//!   "payload": { "olderThanDays": 90 },
//!   "metadata": { "timestamp": 1718000000000, "correlationId": "auth-...", "originService": "auth" },
//!   "priority": 5,
//!   "retryCount": 0
//! }
//! ```

use crate::errors::ProcessingError;
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Tracing and provenance data attached to every envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    /// Milliseconds since the Unix epoch, stamped at publish time
    pub timestamp: i64,
    pub correlation_id: String,
    #[serde(alias = "service")]
    pub origin_service: String,
}

/// The published unit: an event or a job with its payload and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event name or job type
    #[serde(rename = "type", alias = "event")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Milliseconds since the Unix epoch at which a delayed job becomes due
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<i64>,
    #[serde(default)]
    pub retry_count: u32,
    /// Overrides the consuming queue's retry budget for this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Options used when submitting a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub priority: Option<u8>,
    /// Broker-side delay before the job becomes routable
    pub delay_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

impl Envelope {
    /// Wraps an already-encoded payload.
    pub fn new(kind: &str, payload: Value) -> Envelope {
        Envelope {
            id: None,
            kind: kind.to_owned(),
            payload,
            metadata: Metadata::default(),
            priority: None,
            scheduled_for: None,
            retry_count: 0,
            max_retries: None,
        }
    }

    /// Builds an event envelope from any serializable payload.
    pub fn event<T: Serialize>(kind: &str, payload: &T) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope::new(kind, serde_json::to_value(payload)?))
    }

    /// Builds a job envelope with a fresh id, priority (default 0) and schedule.
    pub fn job<T: Serialize>(
        job_type: &str,
        payload: &T,
        options: &JobOptions,
    ) -> Result<Envelope, serde_json::Error> {
        let mut envelope = Envelope::event(job_type, payload)?;
        envelope.id = Some(generate_id());
        envelope.priority = Some(options.priority.unwrap_or_default());
        envelope.max_retries = options.max_retries;
        envelope.scheduled_for = options
            .delay_ms
            .filter(|delay| *delay > 0)
            .map(|delay| now_millis().saturating_add_unsigned(delay));
        Ok(envelope)
    }

    pub fn with_origin(mut self, service: &str) -> Self {
        self.metadata.origin_service = service.to_owned();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.metadata.correlation_id = correlation_id.to_owned();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the publish timestamp and fills in provenance the caller left empty.
    pub(crate) fn stamp(&mut self, service_name: &str) {
        self.metadata.timestamp = now_millis();

        if self.metadata.correlation_id.is_empty() {
            self.metadata.correlation_id = generate_correlation_id(service_name);
        }

        if self.metadata.origin_service.is_empty() {
            self.metadata.origin_service = service_name.to_owned();
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Envelope, ProcessingError> {
        serde_json::from_slice(data).map_err(|err| ProcessingError::Decode(err.to_string()))
    }

    /// Deserializes the payload into the handler's type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProcessingError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn random_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(13);
    suffix
}

/// `{timestampMs}-{random}`
pub fn generate_id() -> String {
    format!("{}-{}", now_millis(), random_suffix())
}

/// `{serviceName}-{timestampMs}-{random}`
pub fn generate_correlation_id(service_name: &str) -> String {
    format!("{}-{}-{}", service_name, now_millis(), random_suffix())
}
