// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Service
//!
//! Named job handlers bound to queues. A worker only runs jobs of its own `jobType`; each
//! run is bounded by a timeout, at most `concurrency_limit` runs execute at once per queue,
//! and failures are retried in-process with exponential backoff. Once local retries are
//! exhausted the failure is logged and the job is settled; workers opting into
//! `escalate` hand the failure to the broker-level retry path instead.

use crate::{
    consumer::{ConsumeOptions, ConsumerHandle, ConsumerRuntime},
    envelope::Envelope,
    errors::{ProcessingError, PublishError, WorkerError},
    handler::MessageHandler,
    publisher::Publisher,
    retry::{RetryPolicy, RetryService},
    task::TaskScope,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Execution settings of one registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerOptions {
    /// In-process retries after the first attempt
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_factor: u32,
    /// Jobs of this worker running at once
    pub concurrency_limit: usize,
    /// Upper bound of a single attempt
    pub timeout_ms: u64,
    /// Hand failures left after local retries to the broker-level retry path
    pub escalate: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_factor: 2,
            concurrency_limit: 1,
            timeout_ms: 60_000,
            escalate: false,
        }
    }
}

impl WorkerOptions {
    /// The in-process retry policy built from these options.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay_ms, self.backoff_factor)
    }

    /// Time limit of a single attempt.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A handler registered for the jobs of one queue.
#[derive(Clone)]
pub struct WorkerRegistration {
    pub queue_name: String,
    pub job_type: String,
    pub handler: Arc<dyn MessageHandler>,
    pub options: WorkerOptions,
}

/// Runs registered job workers with local retries, timeouts and concurrency limits.
pub struct WorkerService {
    consumers: Arc<ConsumerRuntime>,
    retry: Arc<RetryService>,
    publisher: Arc<Publisher>,
    scope: TaskScope,
    retry_exchange: String,
    registrations: RwLock<HashMap<String, WorkerRegistration>>,
}

impl WorkerService {
    /// Creates the service.
    ///
    /// # Parameters
    /// * `consumers` - Subscribes started workers to their queues
    /// * `retry` - Runs the in-process retries of each job
    /// * `publisher` - Publishes scheduled jobs and escalated failures
    /// * `scope` - Cancelled at shutdown; interrupts backoff sleeps and running attempts
    /// * `retry_exchange` - Delayed exchange escalated failures are republished to
    pub fn new(
        consumers: Arc<ConsumerRuntime>,
        retry: Arc<RetryService>,
        publisher: Arc<Publisher>,
        scope: TaskScope,
        retry_exchange: &str,
    ) -> WorkerService {
        WorkerService {
            consumers,
            retry,
            publisher,
            scope,
            retry_exchange: retry_exchange.to_owned(),
            registrations: RwLock::new(HashMap::default()),
        }
    }

    /// Registers the worker for `queue_name`. A later registration for the same queue
    /// replaces the earlier one.
    pub fn register_worker(
        &self,
        queue_name: &str,
        job_type: &str,
        handler: Arc<dyn MessageHandler>,
        options: WorkerOptions,
    ) {
        let registration = WorkerRegistration {
            queue_name: queue_name.to_owned(),
            job_type: job_type.to_owned(),
            handler,
            options,
        };

        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(previous) = registrations.insert(queue_name.to_owned(), registration) {
            warn!(
                queue = queue_name,
                previous = previous.job_type,
                job_type,
                "replacing worker already registered for queue"
            );
        }
        info!(queue = queue_name, job_type, "worker registered");
    }

    /// The worker registered for `queue_name`, if any.
    pub fn registration(&self, queue_name: &str) -> Option<WorkerRegistration> {
        self.registrations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(queue_name)
            .cloned()
    }

    /// Queues with a registered worker.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .registrations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        queues.sort();
        queues
    }

    /// Subscribes the worker registered for `queue_name`.
    pub async fn start(&self, queue_name: &str) -> Result<ConsumerHandle, WorkerError> {
        let registration = self
            .registration(queue_name)
            .ok_or_else(|| WorkerError::NotRegistered(queue_name.to_owned()))?;

        let options = &registration.options;
        let mut consume = ConsumeOptions::default()
            .retry_exchange(&self.retry_exchange)
            .policy(options.retry_policy())
            .concurrency(options.concurrency_limit);
        if !options.escalate {
            consume = consume.without_retry();
        }

        let handler = Arc::new(WorkerHandler {
            job_type: registration.job_type.clone(),
            handler: registration.handler.clone(),
            options: options.clone(),
            retry: self.retry.clone(),
            scope: self.scope.clone(),
        });

        let handle = self.consumers.consume(queue_name, handler, consume).await?;
        info!(
            queue = queue_name,
            job_type = registration.job_type,
            "worker started"
        );

        Ok(handle)
    }

    /// Starts every registered worker, in queue name order.
    pub async fn start_all(&self) -> Result<Vec<ConsumerHandle>, WorkerError> {
        let mut handles = Vec::new();
        for queue in self.queues() {
            handles.push(self.start(&queue).await?);
        }
        Ok(handles)
    }

    /// Publishes a new job, delayed when `delay_ms` is set and not zero.
    pub async fn schedule_job(
        &self,
        exchange: &str,
        routing_key: &str,
        job: &mut Envelope,
        delay_ms: Option<u64>,
    ) -> Result<(), PublishError> {
        match delay_ms {
            Some(delay_ms) if delay_ms > 0 => {
                self.publisher
                    .publish_with_delay(exchange, routing_key, job, delay_ms)
                    .await
            }
            _ => self.publisher.publish(exchange, routing_key, job).await,
        }
    }
}

/// Runs one registration's handler under its type filter, timeout and retry policy.
struct WorkerHandler {
    job_type: String,
    handler: Arc<dyn MessageHandler>,
    options: WorkerOptions,
    retry: Arc<RetryService>,
    scope: TaskScope,
}

#[async_trait]
impl MessageHandler for WorkerHandler {
    async fn handle(&self, ctx: &Context, envelope: &Envelope) -> Result<(), ProcessingError> {
        if envelope.kind != self.job_type {
            debug!(
                kind = envelope.kind,
                job_type = self.job_type,
                "skipping job of another type"
            );
            return Ok(());
        }

        let limit = self.options.timeout();
        let result = self
            .retry
            .execute_with_retry(&self.options.retry_policy(), |attempt| {
                let handler = &self.handler;
                let scope = &self.scope;
                async move {
                    debug!(attempt, "running job");
                    scope.timeout(limit, handler.handle(ctx, envelope)).await?
                }
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(ProcessingError::Cancelled) => Err(ProcessingError::Cancelled),
            Err(err) if self.options.escalate => Err(err),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    job_type = self.job_type,
                    id = ?envelope.id,
                    "job failed"
                );
                Ok(())
            }
        }
    }
}
