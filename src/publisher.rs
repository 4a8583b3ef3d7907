// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Writes envelopes to exchanges (immediately or with a broker-side delay) or directly to
//! a queue. Every publish stamps `metadata.timestamp`, fills in a correlation id when the
//! caller did not supply one, and propagates the current OpenTelemetry context in the
//! message headers.

use crate::{
    broker::{Broker, HeaderValue, Headers, OutgoingMessage, AMQP_HEADERS_DELAY},
    connection::LossReporter,
    envelope::Envelope,
    errors::PublishError,
    otel,
    topology::Topology,
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes envelopes through a shared [`Broker`].
pub struct Publisher {
    broker: Arc<dyn Broker>,
    service_name: String,
    /// Known exchanges and whether they accept delayed messages
    exchanges: HashMap<String, bool>,
    losses: Option<LossReporter>,
}

impl Publisher {
    /// `service_name` is stamped as the origin of every envelope it publishes.
    pub fn new(broker: Arc<dyn Broker>, service_name: &str) -> Publisher {
        Publisher {
            broker,
            service_name: service_name.to_owned(),
            exchanges: HashMap::default(),
            losses: None,
        }
    }

    /// Reports publishes that failed because the session is gone, so a service that only
    /// publishes still reconnects.
    pub fn with_loss_reporter(mut self, losses: LossReporter) -> Self {
        self.losses = Some(losses);
        self
    }

    /// Lets the publisher refuse delayed publishes to exchanges it knows are not delayed.
    pub fn with_topology(mut self, topology: &Topology) -> Self {
        self.exchanges = topology
            .exchanges
            .iter()
            .map(|exch| (exch.name.clone(), exch.is_delayed()))
            .collect();
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Publishes a persistent message to `exchange` with `routing_key`.
    ///
    /// Succeeds once the broker accepted the message for routing. `envelope` is stamped in
    /// place, so after the call it is exactly what was written.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &mut Envelope,
    ) -> Result<(), PublishError> {
        self.publish_envelope(exchange, routing_key, envelope, Headers::new())
            .await
    }

    /// Like [`Publisher::publish`], with an `x-delay` header. The target must be a
    /// delayed-message exchange; the message becomes routable after `delay_ms`.
    pub async fn publish_with_delay(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &mut Envelope,
        delay_ms: u64,
    ) -> Result<(), PublishError> {
        let mut headers = Headers::new();
        headers.insert(AMQP_HEADERS_DELAY.to_owned(), delay_header(delay_ms));

        self.publish_envelope(exchange, routing_key, envelope, headers)
            .await
    }

    /// Writes directly to `queue` through the default exchange, bypassing bindings.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        envelope: &mut Envelope,
    ) -> Result<(), PublishError> {
        self.publish_envelope("", queue, envelope, Headers::new())
            .await
    }

    /// Stamps and publishes `envelope` with extra headers.
    pub(crate) async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &mut Envelope,
        headers: Headers,
    ) -> Result<(), PublishError> {
        if headers.contains_key(AMQP_HEADERS_DELAY) {
            self.ensure_delayed(exchange)?;
        }

        let message = self.prepare(exchange, routing_key, envelope, headers)?;
        self.publish_raw(message).await
    }

    /// Fails for exchanges known from the topology that cannot delay messages.
    pub(crate) fn ensure_delayed(&self, exchange: &str) -> Result<(), PublishError> {
        if self.exchanges.get(exchange) == Some(&false) {
            error!(exchange, "delayed publish to a non-delayed exchange");
            return Err(PublishError::NotDelayed(exchange.to_owned()));
        }
        Ok(())
    }

    /// Publishes a fully built message, adding the trace context to its headers.
    pub(crate) async fn publish_raw(&self, mut message: OutgoingMessage) -> Result<(), PublishError> {
        otel::inject_current(&mut message.headers);
        let session = self.losses.as_ref().map(LossReporter::generation);

        match self.broker.publish(&message).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = message.exchange,
                    routing_key = message.routing_key,
                    "error publishing message"
                );
                if let (Some(losses), Some(session)) = (&self.losses, session) {
                    if err.is_connection_loss() {
                        losses.report(session);
                    }
                }
                Err(err)
            }
            Ok(()) => {
                debug!(
                    exchange = message.exchange,
                    routing_key = message.routing_key,
                    "message published"
                );
                Ok(())
            }
        }
    }

    fn prepare(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &mut Envelope,
        headers: Headers,
    ) -> Result<OutgoingMessage, PublishError> {
        envelope.stamp(&self.service_name);

        let body = envelope
            .encode()
            .map_err(|err| PublishError::Encode(err.to_string()))?;

        Ok(OutgoingMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body,
            headers,
            message_type: Some(envelope.kind.clone()),
            message_id: Some(
                envelope
                    .id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            correlation_id: Some(envelope.metadata.correlation_id.clone()),
            priority: envelope.priority,
            persistent: true,
        })
    }
}

pub(crate) fn delay_header(delay_ms: u64) -> HeaderValue {
    HeaderValue::Int(i64::try_from(delay_ms).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBroker, exchange::ExchangeDefinition};
    use serde_json::json;

    #[tokio::test]
    async fn publish_with_delay_sets_x_delay_and_round_trips_body() {
        let mut broker = MockBroker::new();
        let (tx, rx) = std::sync::mpsc::channel();
        broker.expect_publish().times(1).returning(move |msg| {
            tx.send(msg.clone()).unwrap();
            Ok(())
        });

        let publisher = Publisher::new(Arc::new(broker), "auth");
        let mut envelope = Envelope::new("user.created", json!({ "id": "u-1" }));

        publisher
            .publish_with_delay("delayed_exchange", "user.created", &mut envelope, 5000)
            .await
            .unwrap();

        let sent = rx.recv().unwrap();
        assert_eq!(sent.delay_ms(), Some(5000));
        assert_eq!(sent.exchange, "delayed_exchange");
        assert_eq!(sent.routing_key, "user.created");
        assert!(sent.persistent);
        assert_eq!(sent.message_type.as_deref(), Some("user.created"));
        assert_eq!(Envelope::decode(&sent.body).unwrap(), envelope);
    }

    #[tokio::test]
    async fn publish_stamps_metadata() {
        let mut broker = MockBroker::new();
        broker.expect_publish().times(1).returning(|_| Ok(()));

        let publisher = Publisher::new(Arc::new(broker), "order");
        let mut envelope = Envelope::new("order.created", json!({}));

        publisher
            .publish("order_events", "order.created", &mut envelope)
            .await
            .unwrap();

        assert!(envelope.metadata.timestamp > 0);
        assert!(envelope.metadata.correlation_id.starts_with("order-"));
        assert_eq!(envelope.metadata.origin_service, "order");
    }

    #[tokio::test]
    async fn send_to_queue_uses_default_exchange() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|msg| msg.exchange.is_empty() && msg.routing_key == "background_jobs_queue")
            .times(1)
            .returning(|_| Ok(()));

        let publisher = Publisher::new(Arc::new(broker), "auth");
        let mut envelope = Envelope::new("user_cleanup", json!({ "olderThanDays": 90 }));

        publisher
            .send_to_queue("background_jobs_queue", &mut envelope)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refuses_delay_on_known_non_delayed_exchange() {
        let mut broker = MockBroker::new();
        broker.expect_publish().never();

        let topology = Topology::new().exchange(ExchangeDefinition::new("user_events").topic());
        let publisher = Publisher::new(Arc::new(broker), "auth").with_topology(&topology);
        let mut envelope = Envelope::new("user.created", json!({}));

        let result = publisher
            .publish_with_delay("user_events", "user.created", &mut envelope, 1000)
            .await;

        assert_eq!(result, Err(PublishError::NotDelayed("user_events".to_owned())));
    }

    #[tokio::test]
    async fn surfaces_broker_errors() {
        let mut broker = MockBroker::new();
        broker.expect_publish().returning(|msg| {
            Err(PublishError::Rejected {
                exchange: msg.exchange.clone(),
                reason: "channel closed".to_owned(),
            })
        });

        let publisher = Publisher::new(Arc::new(broker), "auth");
        let mut envelope = Envelope::new("user.created", json!({}));

        let result = publisher.publish("user_events", "user.created", &mut envelope).await;
        assert!(matches!(result, Err(PublishError::Rejected { .. })));
    }
}
