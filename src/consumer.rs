// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Per-queue message loop. Every delivery goes through the same state machine:
//!
//! ```text
//! Received -> Processing -> Acked
//!                        -> RequeuedForRetry (copy republished to the retry exchange, original acked)
//!                        -> DeadLettered     (nack without requeue)
//!                        -> Released         (nack with requeue, shutdown interrupted the handler)
//!                        -> Abandoned        (no settlement, the session it arrived on is gone)
//! ```
//!
//! A message is settled exactly once on every path. Delivery tags only mean something on
//! the channel that issued them, so a delivery whose session was replaced by a reconnect
//! is left alone: the broker already requeued it when the old channel closed.
//!
//! Rejected messages only survive if the queue has a dead-letter exchange; without one
//! the broker drops them.

use crate::{
    broker::{Broker, Delivery, DeliveryStream},
    connection::ConnectionManager,
    envelope::Envelope,
    errors::{ConsumeError, ProcessingError},
    handler::MessageHandler,
    otel::{self, CONSUMER_TRACER},
    retry::{RetryPolicy, RetryService},
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default exchange retry copies are republished to
pub const DEFAULT_RETRY_EXCHANGE: &str = "retry_exchange";

/// Per-subscription settlement and flow-control settings.
///
/// The default retries through [`DEFAULT_RETRY_EXCHANGE`] with the default
/// [`RetryPolicy`] and runs one handler at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Delayed exchange receiving retry copies; `None` dead-letters every failure
    pub retry_exchange: Option<String>,
    /// Routing key for retry copies; defaults to the delivery's own routing key
    pub retry_routing_key: Option<String>,
    pub policy: RetryPolicy,
    /// Broker prefetch; defaults to `concurrency`
    pub prefetch: Option<u16>,
    /// Maximum handler executions running at once for this queue
    pub concurrency: usize,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            retry_exchange: Some(DEFAULT_RETRY_EXCHANGE.to_owned()),
            retry_routing_key: None,
            policy: RetryPolicy::default(),
            prefetch: None,
            concurrency: 1,
        }
    }
}

impl ConsumeOptions {
    /// Republishes retry copies to `exchange`, which must be a delayed-message exchange.
    pub fn retry_exchange(mut self, exchange: &str) -> Self {
        self.retry_exchange = Some(exchange.to_owned());
        self
    }

    /// Routes retry copies with `routing_key` instead of the delivery's own key.
    pub fn retry_routing_key(mut self, routing_key: &str) -> Self {
        self.retry_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Failures are never republished; they go straight to the dead-letter exchange.
    pub fn without_retry(mut self) -> Self {
        self.retry_exchange = None;
        self
    }

    /// Retry budget and backoff; a message's own `maxRetries` still takes precedence.
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Unacknowledged deliveries the broker may push before waiting for settlements.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Handler executions allowed at once; values below one are raised to one.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn effective_prefetch(&self) -> u16 {
        self.prefetch
            .unwrap_or_else(|| u16::try_from(self.concurrency).unwrap_or(u16::MAX))
    }
}

/// A live subscription: the queue and the consumer tag used to cancel it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerHandle {
    pub queue: String,
    pub consumer_tag: String,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    RequeuedForRetry { retry_count: u32, delay_ms: u64 },
    DeadLettered,
    Released,
    /// Not settled: the connection it arrived on was replaced while it was processed
    Abandoned,
}

/// Subscribes handlers to queues on the shared connection.
pub struct ConsumerRuntime {
    connection: Arc<ConnectionManager>,
    retry: Arc<RetryService>,
    service_name: String,
}

impl ConsumerRuntime {
    /// Creates the runtime.
    ///
    /// # Parameters
    /// * `connection` - Session manager that subscriptions track themselves on and recover through
    /// * `retry` - Republishes retry copies of failed deliveries
    /// * `service_name` - Prefix of every generated consumer tag
    pub fn new(
        connection: Arc<ConnectionManager>,
        retry: Arc<RetryService>,
        service_name: &str,
    ) -> ConsumerRuntime {
        ConsumerRuntime {
            connection,
            retry,
            service_name: service_name.to_owned(),
        }
    }

    /// Starts consuming `queue` with `handler`.
    ///
    /// Deliveries are processed on spawned tasks, at most `options.concurrency` at a time.
    /// When the delivery stream ends outside of shutdown the subscription reconnects and
    /// subscribes again with a new consumer tag.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, ConsumeError> {
        match self.connection.topology().find_queue(queue) {
            Some(def) if !def.has_dead_letter_exchange() => warn!(
                queue,
                "queue has no dead-letter exchange, messages exhausting their retries will be dropped"
            ),
            _ => {}
        }

        let subscription = Arc::new(Subscription {
            queue: queue.to_owned(),
            service_name: self.service_name.clone(),
            permits: Arc::new(Semaphore::new(options.concurrency.max(1))),
            handler,
            options,
            connection: self.connection.clone(),
            retry: self.retry.clone(),
            tracer: global::tracer(CONSUMER_TRACER),
        });

        let generation = self.connection.generation();
        let (handle, stream) = subscription.subscribe().await?;

        tokio::spawn(subscription.run(handle.clone(), stream, generation));

        Ok(handle)
    }
}

struct Subscription {
    queue: String,
    service_name: String,
    handler: Arc<dyn MessageHandler>,
    options: ConsumeOptions,
    connection: Arc<ConnectionManager>,
    retry: Arc<RetryService>,
    permits: Arc<Semaphore>,
    tracer: BoxedTracer,
}

impl Subscription {
    async fn subscribe(&self) -> Result<(ConsumerHandle, DeliveryStream), ConsumeError> {
        let broker = self.connection.broker();

        broker.qos(self.options.effective_prefetch()).await?;

        let handle = ConsumerHandle {
            queue: self.queue.clone(),
            consumer_tag: format!("{}-{}-{}", self.service_name, self.queue, Uuid::new_v4()),
        };

        let stream = broker
            .consume(&handle.queue, &handle.consumer_tag)
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), queue = self.queue, "failure to consume");
            })?;

        self.connection.track_consumer(&handle);
        debug!(queue = self.queue, tag = handle.consumer_tag, "consumer subscribed");

        Ok((handle, stream))
    }

    async fn run(
        self: Arc<Self>,
        mut handle: ConsumerHandle,
        mut stream: DeliveryStream,
        mut generation: u64,
    ) {
        let scope = self.connection.scope().clone();

        loop {
            self.clone().drain(&mut stream, generation).await;
            self.connection.untrack_consumer(&handle.consumer_tag);

            if scope.is_cancelled() {
                debug!(queue = self.queue, "consumer stopped");
                return;
            }

            warn!(queue = self.queue, "consumer stream closed, recovering connection");
            if let Err(err) = self.connection.recover(generation).await {
                error!(
                    error = err.to_string(),
                    queue = self.queue,
                    "consumer not resubscribed"
                );
                return;
            }

            generation = self.connection.generation();
            match self.subscribe().await {
                Ok((next_handle, next_stream)) => {
                    handle = next_handle;
                    stream = next_stream;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = self.queue,
                        "failure to resubscribe after reconnect"
                    );
                    return;
                }
            }
        }
    }

    /// Pulls deliveries until the stream ends or shutdown begins.
    async fn drain(self: Arc<Self>, stream: &mut DeliveryStream, generation: u64) {
        let scope = self.connection.scope().clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = scope.cancelled() => return,
                next = stream.next() => next,
            };

            let delivery = match next {
                None => return,
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue = self.queue, "error receiving delivery");
                    continue;
                }
                Some(Ok(delivery)) => Delivery {
                    session: generation,
                    ..delivery
                },
            };

            let permit = tokio::select! {
                biased;
                _ = scope.cancelled() => return,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let this = self.clone();
            tokio::spawn(async move {
                let broker = this.connection.broker();
                let connection = this.connection.clone();
                let result = process_delivery(
                    broker.as_ref(),
                    &this.retry,
                    this.handler.as_ref(),
                    &this.options,
                    &this.tracer,
                    &move || connection.generation(),
                    delivery,
                )
                .await;

                if let Err(err) = result {
                    error!(error = err.to_string(), queue = this.queue, "failure to settle message");
                }
                drop(permit);
            });
        }
    }
}

/// Runs one delivery through decode, handler and settlement.
///
/// # Parameters
/// * `live_session` - Reads the current connection generation; settlement is skipped when
///   it no longer matches `delivery.session`
///
/// # Returns
/// How the delivery was settled, or the error of the failed ack/nack
pub(crate) async fn process_delivery(
    broker: &dyn Broker,
    retry: &RetryService,
    handler: &dyn MessageHandler,
    options: &ConsumeOptions,
    tracer: &BoxedTracer,
    live_session: &(dyn Fn() -> u64 + Send + Sync),
    delivery: Delivery,
) -> Result<Disposition, ConsumeError> {
    let decoded = Envelope::decode(&delivery.data);

    let kind = match &decoded {
        Ok(envelope) => envelope.kind.clone(),
        Err(_) => delivery.message_type.clone().unwrap_or_default(),
    };

    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, &kind);

    debug!("received: {} - exchange: {}", kind, delivery.exchange);

    let result = match &decoded {
        Ok(envelope) => handler.handle(&ctx, envelope).await,
        Err(err) => Err(err.clone()),
    };

    if delivery.session != live_session() {
        warn!(
            kind,
            delivery_tag = delivery.delivery_tag,
            "connection replaced while processing, leaving message to broker redelivery"
        );
        span.set_status(Status::Error {
            description: Cow::from("session closed before settlement"),
        });
        return Ok(Disposition::Abandoned);
    }

    let err = match result {
        Ok(()) => {
            debug!("message successfully processed");
            ack(broker, &delivery, &mut span).await?;
            span.set_status(Status::Ok);
            return Ok(Disposition::Acked);
        }
        Err(err) => err,
    };

    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    if err == ProcessingError::Cancelled {
        warn!(kind, "processing interrupted by shutdown, releasing message");
        nack(broker, &delivery, true, &mut span).await?;
        return Ok(Disposition::Released);
    }

    if !err.is_retryable() {
        warn!(error = err.to_string(), kind, "rejecting message - reason: terminal failure");
        nack(broker, &delivery, false, &mut span).await?;
        return Ok(Disposition::DeadLettered);
    }

    let Some(exchange) = options.retry_exchange.as_deref() else {
        warn!(error = err.to_string(), kind, "no retry exchange configured, rejecting message");
        nack(broker, &delivery, false, &mut span).await?;
        return Ok(Disposition::DeadLettered);
    };

    let policy = match decoded.as_ref().ok().and_then(|envelope| envelope.max_retries) {
        Some(max_retries) => RetryPolicy {
            max_retries,
            ..options.policy
        },
        None => options.policy,
    };

    let retry_count = delivery.retry_count().saturating_add(1);
    if !policy.allows(retry_count) {
        error!(
            error = err.to_string(),
            kind,
            "too many attempts ({}), sending to dead-letter exchange",
            retry_count - 1
        );
        nack(broker, &delivery, false, &mut span).await?;
        return Ok(Disposition::DeadLettered);
    }

    let routing_key = options
        .retry_routing_key
        .as_deref()
        .unwrap_or(&delivery.routing_key);

    warn!(error = err.to_string(), kind, "error while handling msg, requeuing for later");
    match retry
        .reschedule(
            exchange,
            routing_key,
            &delivery,
            decoded.as_ref().ok(),
            retry_count,
            &policy,
        )
        .await
    {
        Ok(scheduled) => {
            ack(broker, &delivery, &mut span).await?;
            Ok(Disposition::RequeuedForRetry {
                retry_count: scheduled.retry_count,
                delay_ms: scheduled.delay_ms,
            })
        }
        Err(err) => {
            error!(error = err.to_string(), "error while requeuing, rejecting message");
            nack(broker, &delivery, false, &mut span).await?;
            Ok(Disposition::DeadLettered)
        }
    }
}

async fn ack(broker: &dyn Broker, delivery: &Delivery, span: &mut BoxedSpan) -> Result<(), ConsumeError> {
    broker.ack(delivery.delivery_tag).await.inspect_err(|err| {
        error!("error while ack msg");
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from("error to ack msg"),
        });
    })
}

async fn nack(
    broker: &dyn Broker,
    delivery: &Delivery,
    requeue: bool,
    span: &mut BoxedSpan,
) -> Result<(), ConsumeError> {
    broker
        .nack(delivery.delivery_tag, requeue)
        .await
        .inspect_err(|err| {
            error!("error while nack msg");
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
        })
}
