// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Client
//!
//! One object per service process wiring the connection, publisher, consumer runtime,
//! retry service and worker service around a single broker session. Services call
//! [`MessagingClient::init`] before accepting traffic and [`MessagingClient::shutdown`]
//! when stopping.

use crate::{
    broker::Broker,
    channel::AmqpBroker,
    config::MessagingConfig,
    connection::{ConnectionManager, ConnectionState},
    consumer::{ConsumeOptions, ConsumerHandle, ConsumerRuntime},
    contracts::{ConsumerAdapter, EventConsumer, JobWorker, WorkerAdapter},
    envelope::{now_millis, Envelope, JobOptions},
    errors::{ConsumeError, MessagingError, ProcessingError, PublishError, TopologyError, WorkerError},
    handler::MessageHandler,
    producer::Producer,
    publisher::Publisher,
    retry::{RetryPolicy, RetryService, ScheduledRetry},
    topology::Topology,
    worker::{WorkerOptions, WorkerService},
};
use serde::Serialize;
use std::{future::Future, sync::Arc};
use tracing::info;

/// The messaging entry point of a service process.
pub struct MessagingClient {
    config: MessagingConfig,
    connection: Arc<ConnectionManager>,
    publisher: Arc<Publisher>,
    retry: Arc<RetryService>,
    consumers: Arc<ConsumerRuntime>,
    workers: WorkerService,
}

impl MessagingClient {
    /// A client talking to RabbitMQ with the connection settings in `config`.
    ///
    /// Connection errors raised by the transport are reported to the client's connection
    /// manager, which reconnects even when no consumer is running.
    pub fn amqp(config: MessagingConfig, topology: Topology) -> MessagingClient {
        let broker = Arc::new(AmqpBroker::new(config.rabbitmq.clone()));
        let client = MessagingClient::new(broker.clone(), topology, config);
        broker.report_losses_to(client.connection.loss_reporter());
        client
    }

    /// Wires every component around `broker`. Nothing is sent until [`MessagingClient::init`].
    ///
    /// # Parameters
    /// * `broker` - Transport shared by every component
    /// * `topology` - Exchanges, queues and bindings declared at init and after reconnects
    /// * `config` - Service name, connection and exchange settings
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, config: MessagingConfig) -> MessagingClient {
        let connection = Arc::new(ConnectionManager::new(
            broker.clone(),
            topology.clone(),
            config.rabbitmq.reconnect.clone(),
        ));

        let publisher = Arc::new(
            Publisher::new(broker, &config.service_name)
                .with_topology(&topology)
                .with_loss_reporter(connection.loss_reporter()),
        );
        let retry = Arc::new(RetryService::new(
            publisher.clone(),
            connection.scope().child(),
        ));
        let consumers = Arc::new(ConsumerRuntime::new(
            connection.clone(),
            retry.clone(),
            &config.service_name,
        ));
        let workers = WorkerService::new(
            consumers.clone(),
            retry.clone(),
            publisher.clone(),
            connection.scope().child(),
            &config.retry_exchange,
        );

        MessagingClient {
            config,
            connection,
            publisher,
            retry,
            consumers,
            workers,
        }
    }

    /// Connects and declares the topology. Do not accept traffic if this fails.
    ///
    /// Once connected, reported connection losses trigger the reconnection loop.
    pub async fn init(&self) -> Result<(), MessagingError> {
        self.connection.init().await?;
        self.connection.watch();
        info!(service = self.config.service_name, "messaging client initialized");
        Ok(())
    }

    /// Cancels consumers, then closes the channel and the connection.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    /// Current state of the broker session.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Session manager shared by every component.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Low-level publisher shared by producers, retries and workers.
    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Registered job workers.
    pub fn workers(&self) -> &WorkerService {
        &self.workers
    }

    /// Declares topology beyond what the client was built with.
    pub async fn declare(&self, topology: &Topology) -> Result<(), TopologyError> {
        self.connection.declare(topology).await
    }

    /// Publishes `envelope` to `exchange` with `routing_key`, stamping it in place.
    ///
    /// # Returns
    /// `Ok` once the broker accepted the message. A failure caused by a lost session also
    /// starts the reconnection loop.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &mut Envelope,
    ) -> Result<(), PublishError> {
        self.publisher.publish(exchange, routing_key, envelope).await
    }

    /// Publishes `envelope` with an `x-delay` of `delay_ms`.
    ///
    /// # Parameters
    /// * `exchange` - A delayed-message exchange; exchanges known not to delay are refused
    /// * `delay_ms` - Time before the broker routes the message
    pub async fn publish_with_delay(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &mut Envelope,
        delay_ms: u64,
    ) -> Result<(), PublishError> {
        self.publisher
            .publish_with_delay(exchange, routing_key, envelope, delay_ms)
            .await
    }

    /// Publishes `envelope` straight to `queue` through the default exchange.
    pub async fn send_to_queue(&self, queue: &str, envelope: &mut Envelope) -> Result<(), PublishError> {
        self.publisher.send_to_queue(queue, envelope).await
    }

    /// A producer emitting to `exchange`, with delayed events on the configured delayed exchange.
    pub fn producer(&self, exchange: &str) -> Producer {
        Producer::new(self.publisher.clone(), exchange, &self.config.delayed_exchange)
    }

    /// Emits `payload` as an event of type `routing_key` on `exchange`.
    pub async fn emit<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<Envelope, PublishError> {
        self.producer(exchange).emit(routing_key, payload).await
    }

    /// Starts consuming `queue` with `handler`.
    ///
    /// # Returns
    /// The handle of the first subscription. The subscription resubscribes on its own
    /// after a reconnect, with a new consumer tag.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle, ConsumeError> {
        self.consumers.consume(queue, handler, options).await
    }

    /// Subscribes an event consumer to the queue it names, with its own options.
    pub async fn subscribe<C: EventConsumer>(&self, consumer: Arc<C>) -> Result<ConsumerHandle, ConsumeError> {
        let queue = consumer.queue_name().to_owned();
        let options = consumer.options();
        self.consumers
            .consume(&queue, Arc::new(ConsumerAdapter(consumer)), options)
            .await
    }

    /// Subscribes a job worker; its failures follow the consumer retry path.
    pub async fn subscribe_worker<W: JobWorker>(&self, worker: Arc<W>) -> Result<ConsumerHandle, ConsumeError> {
        let queue = worker.queue_name().to_owned();
        let options = worker.options();
        self.consumers
            .consume(&queue, Arc::new(WorkerAdapter(worker)), options)
            .await
    }

    /// Registers `handler` as the worker for `job_type` jobs on `queue_name`.
    ///
    /// Registration only records the worker; [`MessagingClient::start_worker`] subscribes it.
    pub fn register_worker(
        &self,
        queue_name: &str,
        job_type: &str,
        handler: Arc<dyn MessageHandler>,
        options: WorkerOptions,
    ) {
        self.workers
            .register_worker(queue_name, job_type, handler, options)
    }

    /// Subscribes the worker registered for `queue_name`.
    pub async fn start_worker(&self, queue_name: &str) -> Result<ConsumerHandle, WorkerError> {
        self.workers.start(queue_name).await
    }

    /// Subscribes every registered worker, stopping at the first failure.
    pub async fn start_workers(&self) -> Result<Vec<ConsumerHandle>, WorkerError> {
        self.workers.start_all().await
    }

    /// Publishes `job`, through a delayed publish when `delay_ms` is positive.
    pub async fn schedule_job(
        &self,
        exchange: &str,
        routing_key: &str,
        job: &mut Envelope,
        delay_ms: Option<u64>,
    ) -> Result<(), PublishError> {
        self.workers
            .schedule_job(exchange, routing_key, job, delay_ms)
            .await
    }

    /// Publishes `task` to the delayed exchange, routable after `delay_ms`.
    pub async fn schedule_task<T: Serialize>(
        &self,
        task: &str,
        payload: &T,
        delay_ms: u64,
    ) -> Result<Envelope, PublishError> {
        let mut envelope =
            Envelope::event(task, payload).map_err(|err| PublishError::Encode(err.to_string()))?;
        envelope.scheduled_for = Some(now_millis().saturating_add_unsigned(delay_ms));

        self.publisher
            .publish_with_delay(
                &self.config.delayed_exchange,
                &self.config.scheduled_task_routing_key,
                &mut envelope,
                delay_ms,
            )
            .await?;

        Ok(envelope)
    }

    /// Publishes a background job to the jobs exchange.
    pub async fn enqueue_job<T: Serialize>(
        &self,
        job_type: &str,
        payload: &T,
        priority: Option<u8>,
    ) -> Result<Envelope, PublishError> {
        let options = JobOptions {
            priority,
            ..JobOptions::default()
        };
        let mut job = Envelope::job(job_type, payload, &options)
            .map_err(|err| PublishError::Encode(err.to_string()))?;

        self.publisher
            .publish(
                &self.config.jobs_exchange,
                &self.config.background_job_routing_key,
                &mut job,
            )
            .await?;

        Ok(job)
    }

    /// Runs `task` with in-process retries under `policy`.
    ///
    /// # Returns
    /// The first success, or the last error once the task fails terminally or the retries
    /// run out.
    pub async fn execute_with_retry<T, F, Fut>(&self, policy: &RetryPolicy, task: F) -> Result<T, ProcessingError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        self.retry.execute_with_retry(policy, task).await
    }

    /// Republishes `envelope` for a later retry, on the configured retry exchange unless
    /// `exchange` is given.
    pub async fn schedule_retry(
        &self,
        exchange: Option<&str>,
        routing_key: &str,
        envelope: &mut Envelope,
        policy: &RetryPolicy,
    ) -> Result<ScheduledRetry, PublishError> {
        let exchange = exchange.unwrap_or(&self.config.retry_exchange);
        self.retry
            .schedule_retry(exchange, routing_key, envelope, policy)
            .await
    }
}
