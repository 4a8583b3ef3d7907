// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! The `ConnectionManager` owns the broker session for one service process: it connects
//! and declares the topology at start, runs the capped exponential reconnection loop after
//! a connection loss, and tears everything down in order at shutdown (consumers, then
//! channel, then connection).
//!
//! Losses are noticed in two places: a consumer's delivery stream ending, and the
//! [`LossReporter`] handed to publishers and the transport. Both feed the same
//! deduplicated reconnection loop.

use crate::{
    broker::Broker,
    config::ReconnectPolicy,
    consumer::ConsumerHandle,
    errors::{ConnectionError, MessagingError, TopologyError},
    task::TaskScope,
    topology::{Topology, TopologyManager},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Observable state of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Reconnection was exhausted; the process keeps running without a broker
    Degraded,
    Closed,
}

/// Reports a lost session to the [`ConnectionManager`] that issued it.
///
/// Cheap to clone and safe to call from any thread, including transport callbacks that
/// run outside the tokio runtime.
#[derive(Debug, Clone)]
pub struct LossReporter {
    generation: Arc<AtomicU64>,
    losses: UnboundedSender<u64>,
}

impl LossReporter {
    /// Generation of the live session; capture it before an operation that may fail.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Reports that the session observed at `generation` is gone. Reports for a session
    /// that was already replaced are ignored.
    pub fn report(&self, generation: u64) {
        if self.losses.send(generation).is_err() {
            debug!("connection manager dropped, ignoring connection loss");
        }
    }
}

/// Owns the broker session of one service process.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    topology: Topology,
    topology_manager: TopologyManager,
    reconnect: ReconnectPolicy,
    /// consumer tag -> queue
    consumers: Mutex<HashMap<String, String>>,
    /// Bumped on every successful reconnect
    generation: Arc<AtomicU64>,
    losses: UnboundedSender<u64>,
    loss_receiver: Mutex<Option<UnboundedReceiver<u64>>>,
    recovering: tokio::sync::Mutex<()>,
    state: Mutex<ConnectionState>,
    scope: TaskScope,
}

impl ConnectionManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        topology: Topology,
        reconnect: ReconnectPolicy,
    ) -> ConnectionManager {
        let (losses, loss_receiver) = mpsc::unbounded_channel();
        ConnectionManager {
            topology_manager: TopologyManager::new(broker.clone()),
            broker,
            topology,
            reconnect,
            consumers: Mutex::new(HashMap::default()),
            generation: Arc::new(AtomicU64::new(0)),
            losses,
            loss_receiver: Mutex::new(Some(loss_receiver)),
            recovering: tokio::sync::Mutex::new(()),
            state: Mutex::new(ConnectionState::Disconnected),
            scope: TaskScope::new(),
        }
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Root scope; cancelled when shutdown begins.
    pub fn scope(&self) -> &TaskScope {
        &self.scope
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Number of successful reconnects so far; identifies the live session.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// A handle publishers and transports use to report a lost session.
    pub fn loss_reporter(&self) -> LossReporter {
        LossReporter {
            generation: self.generation.clone(),
            losses: self.losses.clone(),
        }
    }

    /// Starts the background task that turns reported losses into reconnects.
    ///
    /// Call once, after [`ConnectionManager::init`]; reports made before that are discarded.
    /// Later calls do nothing. The task stops at shutdown or when the manager is dropped.
    pub fn watch(self: &Arc<Self>) {
        let Some(mut losses) = lock(&self.loss_receiver).take() else {
            return;
        };
        while losses.try_recv().is_ok() {}

        let manager = Arc::downgrade(self);
        let scope = self.scope.clone();

        tokio::spawn(async move {
            loop {
                let observed = tokio::select! {
                    biased;
                    _ = scope.cancelled() => return,
                    next = losses.recv() => match next {
                        Some(generation) => generation,
                        None => return,
                    },
                };

                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if observed != manager.generation() {
                    continue;
                }

                warn!("rabbitmq connection lost");
                if let Err(err) = manager.recover(observed).await {
                    error!(error = err.to_string(), "connection not recovered");
                }
            }
        });
    }

    /// Connects and declares the service topology. A failure here must stop service start.
    pub async fn init(&self) -> Result<(), MessagingError> {
        debug!("creating amqp connection...");
        self.broker.connect().await.inspect_err(|err| {
            error!(error = err.to_string(), "failure to connect");
        })?;
        debug!("amqp connected");

        self.topology_manager.declare(&self.topology).await?;
        self.set_state(ConnectionState::Connected);

        info!("rabbitmq connection and topology initialized");
        Ok(())
    }

    /// Declares additional topology on the live connection; it is redeclared on reconnect.
    pub async fn declare(&self, topology: &Topology) -> Result<(), TopologyError> {
        self.topology_manager.declare(topology).await
    }

    /// Reconnects after a connection loss observed at `observed_generation`.
    ///
    /// Concurrent callers that observed the same generation share one reconnection loop;
    /// callers arriving after a successful reconnect return immediately. On success the
    /// topology is redeclared. On exhaustion the manager is left `Degraded` and the error
    /// is returned; the process is not terminated.
    pub async fn recover(&self, observed_generation: u64) -> Result<(), ConnectionError> {
        if self.scope.is_cancelled() {
            return Err(ConnectionError::ShuttingDown);
        }

        let _recovering = self.recovering.lock().await;
        if self.generation() != observed_generation {
            debug!("connection already recovered");
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnected);
        let max_attempts = self.reconnect.max_attempts;

        for attempt in 1..=max_attempts {
            let delay = self.reconnect.delay_for(attempt);
            warn!(
                "reconnecting to rabbitmq, attempt {}/{} in {}ms",
                attempt,
                max_attempts,
                delay.as_millis()
            );

            if self.scope.sleep(delay).await.is_err() {
                return Err(ConnectionError::ShuttingDown);
            }

            if let Err(err) = self.broker.connect().await {
                error!(error = err.to_string(), attempt, "reconnection attempt failed");
                continue;
            }

            if let Err(err) = self.topology_manager.redeclare().await {
                error!(error = err.to_string(), attempt, "failure to redeclare topology");
                continue;
            }

            self.generation.fetch_add(1, Ordering::SeqCst);
            self.set_state(ConnectionState::Connected);
            info!(attempt, "rabbitmq connection recovered");
            return Ok(());
        }

        error!(
            attempts = max_attempts,
            "fatal: could not reconnect to rabbitmq, messaging is degraded"
        );
        self.set_state(ConnectionState::Degraded);
        Err(ConnectionError::ReconnectExhausted {
            attempts: max_attempts,
        })
    }

    /// Cancels every tracked consumer, then closes the channel, then the connection.
    ///
    /// Individual failures are logged and do not stop the sequence. Handlers already
    /// running are not aborted.
    pub async fn shutdown(&self) {
        // snapshot first: stopped subscriptions untrack themselves once cancelled
        let mut consumers: Vec<(String, String)> = lock(&self.consumers).drain().collect();
        self.scope.cancel();
        consumers.extend(lock(&self.consumers).drain());

        for (tag, queue) in consumers {
            match self.broker.cancel(&tag).await {
                Err(err) => error!(
                    error = err.to_string(),
                    queue, "error cancelling consumer for queue"
                ),
                Ok(()) => debug!(queue, "consumer cancelled"),
            }
        }

        if let Err(err) = self.broker.close_channel().await {
            error!(error = err.to_string(), "error closing rabbitmq channel");
        }

        if let Err(err) = self.broker.close_connection().await {
            error!(error = err.to_string(), "error closing rabbitmq connection");
        }

        self.set_state(ConnectionState::Closed);
        info!("rabbitmq connection closed");
    }

    pub(crate) fn track_consumer(&self, handle: &ConsumerHandle) {
        lock(&self.consumers).insert(handle.consumer_tag.clone(), handle.queue.clone());
    }

    pub(crate) fn untrack_consumer(&self, consumer_tag: &str) {
        lock(&self.consumers).remove(consumer_tag);
    }

    /// Consumers that will be cancelled at shutdown.
    pub fn consumers(&self) -> Vec<ConsumerHandle> {
        lock(&self.consumers)
            .iter()
            .map(|(tag, queue)| ConsumerHandle {
                queue: queue.clone(),
                consumer_tag: tag.clone(),
            })
            .collect()
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
