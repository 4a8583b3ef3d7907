// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer
//!
//! Emits events and submits jobs on behalf of one service. Events are typed by their
//! routing key; jobs carry their own `type`, an id, a priority and an optional schedule.

use crate::{
    envelope::{Envelope, JobOptions},
    errors::PublishError,
    publisher::Publisher,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Publishes events and jobs for one service through a shared [`Publisher`].
pub struct Producer {
    publisher: Arc<Publisher>,
    exchange: String,
    delayed_exchange: String,
}

impl Producer {
    /// A producer emitting to `exchange`; delayed events go to `delayed_exchange`.
    pub fn new(publisher: Arc<Publisher>, exchange: &str, delayed_exchange: &str) -> Producer {
        Producer {
            publisher,
            exchange: exchange.to_owned(),
            delayed_exchange: delayed_exchange.to_owned(),
        }
    }

    /// Stamped as `metadata.originService` and used as the correlation id prefix.
    pub fn service_name(&self) -> &str {
        self.publisher.service_name()
    }

    /// Exchange events are emitted to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `payload` as an event of type `routing_key`.
    ///
    /// # Returns
    /// The envelope exactly as it was published, stamped with the timestamp and
    /// correlation id.
    pub async fn emit<T: Serialize>(
        &self,
        routing_key: &str,
        payload: &T,
    ) -> Result<Envelope, PublishError> {
        let mut event = self.event(routing_key, payload)?;
        self.publisher
            .publish(&self.exchange, routing_key, &mut event)
            .await?;

        debug!(routing_key, "event emitted");
        Ok(event)
    }

    /// Like [`Producer::emit`], routable only after `delay_ms`.
    pub async fn emit_with_delay<T: Serialize>(
        &self,
        routing_key: &str,
        payload: &T,
        delay_ms: u64,
    ) -> Result<Envelope, PublishError> {
        let mut event = self.event(routing_key, payload)?;
        self.publisher
            .publish_with_delay(&self.delayed_exchange, routing_key, &mut event, delay_ms)
            .await?;

        debug!(routing_key, delay_ms, "delayed event emitted");
        Ok(event)
    }

    /// Publishes a job of `job_type`. A positive `options.delay_ms` publishes it with a delay.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange; must be a delayed-message exchange when delaying
    /// * `routing_key` - Routes the job to the worker queue
    /// * `options` - Priority, delay and per-message retry budget
    ///
    /// # Returns
    /// The published job envelope, including its generated id.
    pub async fn submit_job<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        job_type: &str,
        payload: &T,
        options: JobOptions,
    ) -> Result<Envelope, PublishError> {
        let mut job = Envelope::job(job_type, payload, &options)
            .map_err(|err| PublishError::Encode(err.to_string()))?;

        match options.delay_ms {
            Some(delay_ms) if delay_ms > 0 => {
                self.publisher
                    .publish_with_delay(exchange, routing_key, &mut job, delay_ms)
                    .await?
            }
            _ => self.publisher.publish(exchange, routing_key, &mut job).await?,
        }

        debug!(job_type, id = ?job.id, "job submitted");
        Ok(job)
    }

    fn event<T: Serialize>(&self, routing_key: &str, payload: &T) -> Result<Envelope, PublishError> {
        Envelope::event(routing_key, payload)
            .map(|event| event.with_origin(self.service_name()))
            .map_err(|err| PublishError::Encode(err.to_string()))
    }
}
