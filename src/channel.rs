// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! [`AmqpBroker`] is the lapin implementation of [`Broker`]. It owns one connection and one
//! channel shared by every publisher and consumer of the process; all channel operations
//! are serialized behind a single async mutex.
//!
//! Transport errors on the live connection are forwarded to a [`LossReporter`] when one
//! is registered, and publish failures caused by a dead session surface as
//! [`PublishError::ConnectionLost`].

use crate::{
    broker::{
        Broker, Delivery, DeliveryStream, HeaderValue, Headers, OutgoingMessage,
        JSON_CONTENT_TYPE,
    },
    config::RabbitMQConfig,
    connection::LossReporter,
    errors::{ConnectionError, ConsumeError, PublishError, TopologyError},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

struct Session {
    connection: Connection,
    channel: Channel,
}

pub struct AmqpBroker {
    cfg: RabbitMQConfig,
    session: Mutex<Option<Session>>,
    /// Number of the latest opened connection; errors from older ones are ignored
    sessions: Arc<AtomicU64>,
    losses: std::sync::Mutex<Option<LossReporter>>,
}

impl AmqpBroker {
    pub fn new(cfg: RabbitMQConfig) -> AmqpBroker {
        AmqpBroker {
            cfg,
            session: Mutex::new(None),
            sessions: Arc::new(AtomicU64::new(0)),
            losses: std::sync::Mutex::new(None),
        }
    }

    /// Forwards errors raised on the live connection to `losses`.
    ///
    /// Applies to connections opened after the call.
    pub fn report_losses_to(&self, losses: LossReporter) {
        if let Ok(mut current) = self.losses.lock() {
            *current = Some(losses);
        }
    }

    fn watch_errors(&self, connection: &Connection) {
        let this_session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let sessions = self.sessions.clone();
        let reporter = self.losses.lock().ok().and_then(|losses| losses.clone());

        connection.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            if sessions.load(Ordering::SeqCst) != this_session {
                return;
            }
            if let Some(reporter) = &reporter {
                reporter.report(reporter.generation());
            }
        });
    }

    async fn open(&self) -> Result<Session, ConnectionError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.connection_name.clone()));

        let connection = Connection::connect(&self.cfg.uri(), options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                ConnectionError::Connect(err.to_string())
            })?;
        debug!("amqp connected");
        self.watch_errors(&connection);

        debug!("creating amqp channel...");
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            ConnectionError::Channel(err.to_string())
        })?;

        if self.cfg.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error enabling publisher confirms");
                    ConnectionError::Channel(err.to_string())
                })?;
        }
        debug!("channel created");

        Ok(Session {
            connection,
            channel,
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<(), ConnectionError> {
        let session = self.open().await?;
        let previous = self.session.lock().await.replace(session);

        if let Some(previous) = previous {
            if let Err(err) = previous.connection.close(REPLY_SUCCESS, "reconnecting").await {
                debug!(error = err.to_string(), "previous connection already closed");
            }
        }
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TopologyError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(TopologyError::NotConnected)?;

        session
            .channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                field_table(&def.arguments),
            )
            .await
            .map_err(|err| topology_error("exchange", &def.name, err))?;

        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), TopologyError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(TopologyError::NotConnected)?;

        session
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                field_table(&def.declare_arguments()),
            )
            .await
            .map_err(|err| topology_error("queue", &def.name, err))?;

        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TopologyError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(TopologyError::NotConnected)?;

        session
            .channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| TopologyError::Binding {
                exchange: binding.exchange.clone(),
                queue: binding.queue.clone(),
                reason: err.to_string(),
            })?;

        Ok(())
    }

    async fn publish(&self, message: &OutgoingMessage) -> Result<(), PublishError> {
        let confirm = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or(PublishError::NotConnected)?;

            session
                .channel
                .basic_publish(
                    &message.exchange,
                    &message.routing_key,
                    BasicPublishOptions::default(),
                    &message.body,
                    properties(message),
                )
                .await
                .map_err(|err| publish_error(&message.exchange, err))?
        };

        match confirm.await {
            Ok(Confirmation::Nack(_)) => Err(PublishError::Nacked(message.exchange.clone())),
            Ok(_) => Ok(()),
            Err(err) => Err(publish_error(&message.exchange, err)),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), ConsumeError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ConsumeError::NotConnected)?;

        session
            .channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| ConsumeError::Qos(err.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConsumeError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ConsumeError::NotConnected)?;

        let consumer = session
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| ConsumeError::Subscribe {
                queue: queue.to_owned(),
                reason: err.to_string(),
            })?;

        Ok(consumer
            .map(|item| {
                item.map(delivery)
                    .map_err(|err| ConsumeError::Stream(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumeError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ConsumeError::NotConnected)?;

        session
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| ConsumeError::Ack(err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ConsumeError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ConsumeError::NotConnected)?;

        session
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| ConsumeError::Nack(err.to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConsumeError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ConsumeError::NotConnected)?;

        session
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| ConsumeError::Cancel(err.to_string()))
    }

    async fn close_channel(&self) -> Result<(), ConnectionError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ConnectionError::ShuttingDown)?;

        session
            .channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| ConnectionError::Close(err.to_string()))
    }

    async fn close_connection(&self) -> Result<(), ConnectionError> {
        let Some(session) = self.session.lock().await.take() else {
            return Err(ConnectionError::ShuttingDown);
        };

        session
            .connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| ConnectionError::Close(err.to_string()))
    }
}

fn topology_error(entity: &'static str, name: &str, err: lapin::Error) -> TopologyError {
    if let lapin::Error::ProtocolError(amqp) = &err {
        if matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ) {
            return TopologyError::Conflict {
                entity,
                name: name.to_owned(),
            };
        }
    }

    TopologyError::Declare {
        entity,
        name: name.to_owned(),
        reason: err.to_string(),
    }
}

/// Failures of the connection or channel itself mean the session is gone.
fn publish_error(exchange: &str, err: lapin::Error) -> PublishError {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError => PublishError::ConnectionLost(err.to_string()),
        err => PublishError::Rejected {
            exchange: exchange.to_owned(),
            reason: err.to_string(),
        },
    }
}

fn properties(message: &OutgoingMessage) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_headers(field_table(&message.headers));

    if message.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(kind) = &message.message_type {
        props = props.with_kind(ShortString::from(kind.clone()));
    }
    if let Some(id) = &message.message_id {
        props = props.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(correlation_id) = &message.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(priority) = message.priority {
        props = props.with_priority(priority);
    }

    props
}

fn field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

/// Converts a broker header table; nested tables, arrays and floats are skipped.
fn headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
                AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
                AMQPValue::LongString(v) => {
                    HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}

fn delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        headers: props.headers().as_ref().map(headers).unwrap_or_default(),
        message_type: props.kind().as_ref().map(|v| v.as_str().to_owned()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.as_str().to_owned()),
        priority: *props.priority(),
        data: delivery.data,
        session: 0,
    }
}
