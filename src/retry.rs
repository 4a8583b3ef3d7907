// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Service
//!
//! Exponential backoff shared by both retry modes:
//!
//! - in-process retry ([`RetryService::execute_with_retry`]) calls a task up to
//!   `max_retries + 1` times, sleeping between attempts; nothing survives a crash;
//! - message-based retry ([`RetryService::schedule_retry`]) republishes the message to a
//!   delayed exchange with an incremented `retryCount`, so the state lives in the broker.
//!
//! The delay before retry *k* is `initial_delay_ms * backoff_factor^(k-1)`.

use crate::{
    broker::{Delivery, HeaderValue, Headers, OutgoingMessage, AMQP_HEADERS_DELAY, RETRY_COUNT_HEADER},
    envelope::Envelope,
    errors::{ProcessingError, PublishError},
    publisher::{delay_header, Publisher},
    task::TaskScope,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{error, info, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;

/// Exponential backoff: retry `n` waits `initial_delay_ms * backoff_factor^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    ///
    /// # Parameters
    /// * `max_retries` - Retries allowed after the first attempt
    /// * `initial_delay_ms` - Delay before the first retry
    /// * `backoff_factor` - Multiplier applied to the delay for each further retry
    pub fn new(max_retries: u32, initial_delay_ms: u64, backoff_factor: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms,
            backoff_factor,
        }
    }

    /// Delay before retry `retry` (1-based), saturating on overflow.
    pub fn delay_ms(&self, retry: u32) -> u64 {
        let factor = u64::from(self.backoff_factor)
            .checked_pow(retry.saturating_sub(1))
            .unwrap_or(u64::MAX);
        self.initial_delay_ms.saturating_mul(factor)
    }

    /// [`RetryPolicy::delay_ms`] as a [`Duration`].
    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.delay_ms(retry))
    }

    /// Whether a message on its `retry_count`-th retry may still be retried.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }
}

/// A retry copy that was handed to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRetry {
    /// Retry count carried by the republished copy
    pub retry_count: u32,
    /// Broker-side delay before the copy is routed
    pub delay_ms: u64,
}

/// Retries work in process and republishes failed messages for a broker-side retry.
pub struct RetryService {
    publisher: Arc<Publisher>,
    scope: TaskScope,
}

impl RetryService {
    /// `scope` interrupts backoff sleeps at shutdown.
    pub fn new(publisher: Arc<Publisher>, scope: TaskScope) -> RetryService {
        RetryService { publisher, scope }
    }

    /// Runs `task` until it succeeds, fails terminally, or runs out of retries.
    ///
    /// `task` receives the 1-based attempt number. The last error is returned to the
    /// caller. Shutdown interrupts the backoff sleep with [`ProcessingError::Cancelled`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut task: F,
    ) -> Result<T, ProcessingError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match task(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt > policy.max_retries {
                error!(
                    error = err.to_string(),
                    "failed after {} retries", policy.max_retries
                );
                return Err(err);
            }

            let delay = policy.delay(attempt);
            warn!(
                error = err.to_string(),
                "retry attempt {}/{} after {}ms",
                attempt,
                policy.max_retries,
                delay.as_millis()
            );
            self.scope.sleep(delay).await?;
        }
    }

    /// Republishes `envelope` to `exchange` for a later retry.
    ///
    /// Increments `retry_count`, mirrors it in the `retryCount` header and delays delivery
    /// by the backoff for the new count. Never blocks the caller for the delay.
    pub async fn schedule_retry(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &mut Envelope,
        policy: &RetryPolicy,
    ) -> Result<ScheduledRetry, PublishError> {
        envelope.retry_count += 1;
        let retry_count = envelope.retry_count;
        let delay_ms = policy.delay_ms(retry_count);

        let mut headers = Headers::new();
        headers.insert(RETRY_COUNT_HEADER.to_owned(), HeaderValue::from(retry_count));
        headers.insert(AMQP_HEADERS_DELAY.to_owned(), delay_header(delay_ms));

        self.publisher
            .publish_envelope(exchange, routing_key, envelope, headers)
            .await?;

        info!(
            "scheduled retry #{} in {}ms for {}",
            retry_count, delay_ms, routing_key
        );

        Ok(ScheduledRetry {
            retry_count,
            delay_ms,
        })
    }

    /// Republishes a delivery as retry `retry_count`, keeping its headers and properties.
    ///
    /// When the body decoded, the copy carries the envelope with the new count; otherwise
    /// the raw body is sent unchanged.
    pub(crate) async fn reschedule(
        &self,
        exchange: &str,
        routing_key: &str,
        delivery: &Delivery,
        envelope: Option<&Envelope>,
        retry_count: u32,
        policy: &RetryPolicy,
    ) -> Result<ScheduledRetry, PublishError> {
        self.publisher.ensure_delayed(exchange)?;

        let delay_ms = policy.delay_ms(retry_count);

        let body = match envelope {
            Some(envelope) => {
                let mut copy = envelope.clone();
                copy.retry_count = retry_count;
                copy.stamp(self.publisher.service_name());
                copy.encode()
                    .map_err(|err| PublishError::Encode(err.to_string()))?
            }
            None => delivery.data.clone(),
        };

        let mut headers = delivery.headers.clone();
        headers.insert(RETRY_COUNT_HEADER.to_owned(), HeaderValue::from(retry_count));
        headers.insert(AMQP_HEADERS_DELAY.to_owned(), delay_header(delay_ms));

        self.publisher
            .publish_raw(OutgoingMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                body,
                headers,
                message_type: delivery.message_type.clone(),
                message_id: envelope.and_then(|e| e.id.clone()),
                correlation_id: delivery.correlation_id.clone(),
                priority: delivery.priority,
                persistent: true,
            })
            .await?;

        Ok(ScheduledRetry {
            retry_count,
            delay_ms,
        })
    }
}
