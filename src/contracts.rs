// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Service-side contracts for consuming events and processing jobs. Implementors are
//! subscribed through [`crate::client::MessagingClient::subscribe`] and
//! [`crate::client::MessagingClient::subscribe_worker`].

use crate::{
    consumer::ConsumeOptions, envelope::Envelope, errors::ProcessingError,
    handler::MessageHandler,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// Consumes every event delivered to one queue.
#[async_trait]
pub trait EventConsumer: Send + Sync + 'static {
    fn queue_name(&self) -> &str;

    fn options(&self) -> ConsumeOptions {
        ConsumeOptions::default()
    }

    /// Errors follow the consumer retry path: retryable ones are rescheduled, terminal ones
    /// are dead-lettered.
    async fn process(&self, ctx: &Context, event: &Envelope) -> Result<(), ProcessingError>;
}

/// Processes jobs of one type delivered to one queue.
#[async_trait]
pub trait JobWorker: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send;

    fn queue_name(&self) -> &str;

    fn job_type(&self) -> &str;

    fn options(&self) -> ConsumeOptions {
        ConsumeOptions::default()
    }

    async fn process(&self, ctx: &Context, payload: Self::Payload) -> Result<(), ProcessingError>;
}

pub(crate) struct ConsumerAdapter<C>(pub(crate) Arc<C>);

#[async_trait]
impl<C: EventConsumer> MessageHandler for ConsumerAdapter<C> {
    async fn handle(&self, ctx: &Context, envelope: &Envelope) -> Result<(), ProcessingError> {
        debug!(
            queue = self.0.queue_name(),
            kind = envelope.kind,
            "processing message"
        );
        self.0.process(ctx, envelope).await
    }
}

pub(crate) struct WorkerAdapter<W>(pub(crate) Arc<W>);

#[async_trait]
impl<W: JobWorker> MessageHandler for WorkerAdapter<W> {
    async fn handle(&self, ctx: &Context, envelope: &Envelope) -> Result<(), ProcessingError> {
        if envelope.kind != self.0.job_type() {
            debug!(
                kind = envelope.kind,
                job_type = self.0.job_type(),
                "ignoring job of another type"
            );
            return Ok(());
        }

        let payload = envelope.payload_as::<W::Payload>()?;
        debug!(id = ?envelope.id, "processing job");
        self.0.process(ctx, payload).await
    }
}
