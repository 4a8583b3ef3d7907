// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use rabbitmq_core::{
    broker::{Broker, Delivery, DeliveryStream, HeaderValue, OutgoingMessage},
    client::MessagingClient,
    config::MessagingConfig,
    errors::{ConnectionError, ConsumeError, PublishError, TopologyError},
    exchange::{ExchangeDefinition, ExchangeKind, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE},
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

type Sender = UnboundedSender<Result<Delivery, ConsumeError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect,
    Cancel(String),
    CloseChannel,
    CloseConnection,
}

#[derive(Default)]
struct State {
    connected: bool,
    failing_connects: u32,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueDefinition>,
    bindings: Vec<QueueBinding>,
    /// queue -> (consumer tag, delivery channel)
    consumers: HashMap<String, (String, Sender)>,
    backlog: HashMap<String, VecDeque<Delivery>>,
    in_flight: HashMap<u64, (String, Delivery)>,
    next_tag: u64,
    published: Vec<OutgoingMessage>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    /// acks and nacks naming a tag the current session never issued
    rejected_settlements: usize,
    dropped: Vec<Delivery>,
    events: Vec<Event>,
    declarations: usize,
}

/// Broker double that routes in memory.
///
/// Exchanges route through their bindings (direct, topic and fanout semantics, delayed
/// exchanges by their `x-delayed-type`), rejected messages follow the queue's dead-letter
/// arguments, and unacknowledged deliveries are tracked per tag. Tags restart on every
/// connection, like AMQP channel-scoped tags. `x-delay` is recorded but not waited for.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state().failing_connects = n;
    }

    /// Simulates a connection loss: consumer streams end and unacked deliveries go back
    /// to their queues.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        state.connected = false;
        state.consumers.clear();
        state.requeue_in_flight();
    }

    /// Settlements refused because the tag was unknown to the current session.
    pub fn rejected_settlements(&self) -> usize {
        self.state().rejected_settlements
    }

    pub fn published(&self) -> Vec<OutgoingMessage> {
        self.state().published.clone()
    }

    pub fn published_to(&self, exchange: &str) -> Vec<OutgoingMessage> {
        self.state()
            .published
            .iter()
            .filter(|msg| msg.exchange == exchange)
            .cloned()
            .collect()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.state().nacks.clone()
    }

    /// Messages rejected from a queue without a dead-letter exchange.
    pub fn dropped(&self) -> Vec<Delivery> {
        self.state().dropped.clone()
    }

    /// Messages waiting in `queue` with no consumer attached.
    pub fn backlog(&self, queue: &str) -> Vec<Delivery> {
        self.state()
            .backlog
            .get(queue)
            .map(|msgs| msgs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn connects(&self) -> usize {
        self.state()
            .events
            .iter()
            .filter(|event| **event == Event::Connect)
            .count()
    }

    pub fn declarations(&self) -> usize {
        self.state().declarations
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state().consumers.contains_key(queue)
    }

    pub fn consumer_tag(&self, queue: &str) -> Option<String> {
        self.state().consumers.get(queue).map(|(tag, _)| tag.clone())
    }
}

impl State {
    fn requeue_in_flight(&mut self) {
        let mut in_flight: Vec<(u64, (String, Delivery))> = self.in_flight.drain().collect();
        in_flight.sort_by_key(|(tag, _)| *tag);
        for (_, (queue, mut delivery)) in in_flight {
            delivery.redelivered = true;
            self.backlog.entry(queue).or_default().push_back(delivery);
        }
    }

    fn targets(&self, exchange: &str, routing_key: &str) -> Option<Vec<String>> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()]);
        }

        let def = self.exchanges.get(exchange)?;
        let routing_type = match def.kind {
            ExchangeKind::XMessageDelayed => def
                .arguments
                .get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)
                .and_then(HeaderValue::as_str)
                .unwrap_or("direct")
                .to_owned(),
            ExchangeKind::Topic => "topic".to_owned(),
            ExchangeKind::Fanout => "fanout".to_owned(),
            _ => "direct".to_owned(),
        };

        Some(
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| match routing_type.as_str() {
                    "fanout" => true,
                    "topic" => topic_matches(&b.routing_key, routing_key),
                    _ => b.routing_key == routing_key,
                })
                .map(|b| b.queue.clone())
                .collect(),
        )
    }

    fn enqueue(&mut self, queue: &str, mut delivery: Delivery) {
        self.next_tag += 1;
        delivery.delivery_tag = self.next_tag;

        if let Some((_, sender)) = self.consumers.get(queue) {
            if sender.send(Ok(delivery.clone())).is_ok() {
                self.in_flight
                    .insert(delivery.delivery_tag, (queue.to_owned(), delivery));
                return;
            }
            self.consumers.remove(queue);
        }

        self.backlog
            .entry(queue.to_owned())
            .or_default()
            .push_back(delivery);
    }

    fn route(&mut self, exchange: &str, routing_key: &str, delivery: Delivery) -> bool {
        let Some(targets) = self.targets(exchange, routing_key) else {
            return false;
        };

        for queue in targets {
            let mut copy = delivery.clone();
            copy.exchange = exchange.to_owned();
            copy.routing_key = routing_key.to_owned();
            self.enqueue(&queue, copy);
        }
        true
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), ConnectionError> {
        let mut state = self.state();
        state.events.push(Event::Connect);

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(ConnectionError::Connect("connection refused".into()));
        }

        // a new connection replaces the old one and its channel-scoped tags
        state.consumers.clear();
        state.requeue_in_flight();
        state.next_tag = 0;
        state.connected = true;
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TopologyError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TopologyError::NotConnected);
        }

        state.declarations += 1;
        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => Err(TopologyError::Conflict {
                entity: "exchange",
                name: def.name.clone(),
            }),
            _ => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), TopologyError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TopologyError::NotConnected);
        }

        state.declarations += 1;
        match state.queues.get(&def.name) {
            Some(existing) if existing != def => Err(TopologyError::Conflict {
                entity: "queue",
                name: def.name.clone(),
            }),
            _ => {
                state.queues.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TopologyError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TopologyError::NotConnected);
        }

        state.declarations += 1;
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(&self, message: &OutgoingMessage) -> Result<(), PublishError> {
        let mut state = self.state();
        if !state.connected {
            return Err(PublishError::NotConnected);
        }

        state.published.push(message.clone());

        let delivery = Delivery {
            data: message.body.clone(),
            headers: message.headers.clone(),
            message_type: message.message_type.clone(),
            correlation_id: message.correlation_id.clone(),
            priority: message.priority,
            ..Delivery::default()
        };

        if state.route(&message.exchange, &message.routing_key, delivery) {
            Ok(())
        } else {
            Err(PublishError::Rejected {
                exchange: message.exchange.clone(),
                reason: "NOT_FOUND - no exchange".into(),
            })
        }
    }

    async fn qos(&self, _prefetch: u16) -> Result<(), ConsumeError> {
        if self.state().connected {
            Ok(())
        } else {
            Err(ConsumeError::NotConnected)
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, ConsumeError> {
        let mut state = self.state();
        if !state.connected {
            return Err(ConsumeError::NotConnected);
        }
        if !state.queues.contains_key(queue) {
            return Err(ConsumeError::Subscribe {
                queue: queue.to_owned(),
                reason: "NOT_FOUND - no queue".into(),
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state
            .consumers
            .insert(queue.to_owned(), (consumer_tag.to_owned(), sender));

        let waiting: Vec<Delivery> = state
            .backlog
            .remove(queue)
            .map(Vec::from)
            .unwrap_or_default();
        for delivery in waiting {
            state.enqueue(queue, delivery);
        }

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumeError> {
        let mut state = self.state();
        if state.in_flight.remove(&delivery_tag).is_none() {
            state.rejected_settlements += 1;
            return Err(ConsumeError::Ack(format!("unknown delivery tag {delivery_tag}")));
        }
        state.acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ConsumeError> {
        let mut state = self.state();
        let Some((queue, mut delivery)) = state.in_flight.remove(&delivery_tag) else {
            state.rejected_settlements += 1;
            return Err(ConsumeError::Nack(format!("unknown delivery tag {delivery_tag}")));
        };
        state.nacks.push((delivery_tag, requeue));

        if requeue {
            delivery.redelivered = true;
            state.enqueue(&queue, delivery);
            return Ok(());
        }

        let dead_letter = state.queues.get(&queue).and_then(|def| {
            def.dead_letter_exchange.clone().map(|exchange| {
                let key = def
                    .dead_letter_routing_key
                    .clone()
                    .unwrap_or_else(|| delivery.routing_key.clone());
                (exchange, key)
            })
        });

        match dead_letter {
            Some((exchange, key)) => {
                if !state.route(&exchange, &key, delivery.clone()) {
                    state.dropped.push(delivery);
                }
            }
            None => state.dropped.push(delivery),
        }
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ConsumeError> {
        let mut state = self.state();
        state.events.push(Event::Cancel(consumer_tag.to_owned()));

        let queue = state
            .consumers
            .iter()
            .find(|(_, (tag, _))| tag == consumer_tag)
            .map(|(queue, _)| queue.clone());

        match queue {
            Some(queue) => {
                state.consumers.remove(&queue);
                Ok(())
            }
            None => Err(ConsumeError::Cancel(consumer_tag.to_owned())),
        }
    }

    async fn close_channel(&self) -> Result<(), ConnectionError> {
        let mut state = self.state();
        state.events.push(Event::CloseChannel);
        state.consumers.clear();
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), ConnectionError> {
        let mut state = self.state();
        state.events.push(Event::CloseConnection);
        state.connected = false;
        Ok(())
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

/// Gives spawned tasks time to do anything they were not supposed to do.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

pub const JOBS_QUEUE: &str = "background_jobs_queue";
pub const ORDERS_QUEUE: &str = "orders_queue";
pub const USER_CREATED_QUEUE: &str = "user_created_queue";
pub const DEAD_LETTERS_QUEUE: &str = "dead_letters";

/// Topology shared by the scenarios: job and order queues retry through the delayed
/// `retry_exchange` and dead-letter into `dlx`; `user_created_queue` has no DLX.
pub fn topology() -> Topology {
    Topology::new()
        .exchange(ExchangeDefinition::new("jobs_exchange").topic())
        .exchange(ExchangeDefinition::new("order_events").topic())
        .exchange(ExchangeDefinition::new("user_events").topic())
        .exchange(ExchangeDefinition::new("retry_exchange").topic_delayed())
        .exchange(ExchangeDefinition::new("delayed_exchange").topic_delayed())
        .exchange(ExchangeDefinition::new("dlx").fanout())
        .queue(QueueDefinition::new(JOBS_QUEUE).dead_letter_exchange("dlx"))
        .queue(QueueDefinition::new(ORDERS_QUEUE).dead_letter_exchange("dlx"))
        .queue(QueueDefinition::new(USER_CREATED_QUEUE))
        .queue(QueueDefinition::new(DEAD_LETTERS_QUEUE))
        .binding(
            QueueBinding::new(JOBS_QUEUE)
                .exchange("jobs_exchange")
                .routing_key("job.background"),
        )
        .binding(
            QueueBinding::new(JOBS_QUEUE)
                .exchange("retry_exchange")
                .routing_key("job.background"),
        )
        .binding(
            QueueBinding::new(ORDERS_QUEUE)
                .exchange("order_events")
                .routing_key("order.*"),
        )
        .binding(
            QueueBinding::new(ORDERS_QUEUE)
                .exchange("retry_exchange")
                .routing_key("order.*"),
        )
        .binding(
            QueueBinding::new(USER_CREATED_QUEUE)
                .exchange("user_events")
                .routing_key("user.created"),
        )
        .binding(
            QueueBinding::new(USER_CREATED_QUEUE)
                .exchange("delayed_exchange")
                .routing_key("user.created"),
        )
        .binding(
            QueueBinding::new(DEAD_LETTERS_QUEUE)
                .exchange("dlx")
                .routing_key("#"),
        )
}

/// An initialized client over `broker` for the `auth` service, reconnecting fast.
pub async fn client(broker: Arc<MemoryBroker>) -> MessagingClient {
    let mut config = MessagingConfig::new("auth");
    config.rabbitmq.reconnect.base_delay_ms = 1;

    let client = MessagingClient::new(broker, topology(), config);
    client.init().await.unwrap();
    client
}
