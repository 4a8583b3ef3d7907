// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides the descriptor set a service depends on (`Topology`) and the
//! `TopologyManager` that declares it against the broker.
//!
//! Declaration always runs exchanges first, then queues, then bindings: queues may name
//! an exchange as their dead-letter target and bindings reference both. Declaring the same
//! descriptors again is a no-op; redeclaring a name with different parameters fails with
//! [`TopologyError::Conflict`] before anything is sent to the broker.

use crate::{
    broker::Broker,
    errors::TopologyError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// The exchanges, queues and bindings a service needs before it accepts traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub exchanges: Vec<ExchangeDefinition>,
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
    #[serde(default)]
    pub bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn find_exchange(&self, name: &str) -> Option<&ExchangeDefinition> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn find_queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    /// Splits `other` into the entities not yet part of `self`, failing on any name that
    /// is already present with different parameters.
    fn diff(&self, other: &Topology) -> Result<Topology, TopologyError> {
        let mut pending = Topology::default();

        for def in &other.exchanges {
            let known = self
                .find_exchange(&def.name)
                .or_else(|| pending.find_exchange(&def.name));
            match known {
                Some(existing) if existing != def => {
                    return Err(TopologyError::Conflict {
                        entity: "exchange",
                        name: def.name.clone(),
                    })
                }
                Some(_) => {}
                None => pending.exchanges.push(def.clone()),
            }
        }

        for def in &other.queues {
            let known = self
                .find_queue(&def.name)
                .or_else(|| pending.find_queue(&def.name));
            match known {
                Some(existing) if existing != def => {
                    return Err(TopologyError::Conflict {
                        entity: "queue",
                        name: def.name.clone(),
                    })
                }
                Some(_) => {}
                None => pending.queues.push(def.clone()),
            }
        }

        for binding in &other.bindings {
            if !self.bindings.contains(binding) && !pending.bindings.contains(binding) {
                pending.bindings.push(binding.clone());
            }
        }

        Ok(pending)
    }
}

/// Declares topologies against a broker and remembers what it declared.
pub struct TopologyManager {
    broker: Arc<dyn Broker>,
    declared: Mutex<Topology>,
}

impl TopologyManager {
    pub fn new(broker: Arc<dyn Broker>) -> TopologyManager {
        TopologyManager {
            broker,
            declared: Mutex::new(Topology::default()),
        }
    }

    /// Everything successfully declared through this manager so far.
    pub fn declared(&self) -> Topology {
        self.lock().clone()
    }

    /// Declares the entities of `topology` that were not declared before.
    ///
    /// Identical redeclarations are skipped without touching the broker. A failure is
    /// fatal to service start: the caller must not accept traffic without its topology.
    pub async fn declare(&self, topology: &Topology) -> Result<(), TopologyError> {
        let pending = self.lock().diff(topology)?;

        if pending.is_empty() {
            debug!("topology already declared");
            return Ok(());
        }

        self.install(&pending, true).await
    }

    /// Sends every remembered declaration to the broker again, e.g. after a reconnect.
    pub async fn redeclare(&self) -> Result<(), TopologyError> {
        let declared = self.declared();
        self.install(&declared, false).await
    }

    async fn install(&self, topology: &Topology, remember: bool) -> Result<(), TopologyError> {
        for exch in &topology.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.broker.declare_exchange(exch).await.inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                )
            })?;
            if remember {
                self.lock().exchanges.push(exch.clone());
            }
            debug!("exchange: {} was created", exch.name);
        }

        for queue in &topology.queues {
            debug!("creating queue: {}", queue.name);
            self.broker.declare_queue(queue).await.inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    name = queue.name,
                    "error to declare the queue"
                )
            })?;
            if remember {
                self.lock().queues.push(queue.clone());
            }
            debug!("queue: {} was created", queue.name);
        }

        for binding in &topology.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue, binding.exchange, binding.routing_key
            );
            self.broker.bind_queue(binding).await.inspect_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange")
            })?;
            if remember {
                self.lock().bindings.push(binding.clone());
            }
        }

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Topology> {
        self.declared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
