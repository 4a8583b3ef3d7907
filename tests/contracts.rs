// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use async_trait::async_trait;
use common::{eventually, settle, MemoryBroker, DEAD_LETTERS_QUEUE, JOBS_QUEUE, USER_CREATED_QUEUE};
use opentelemetry::Context;
use rabbitmq_core::{
    contracts::{EventConsumer, JobWorker},
    envelope::{Envelope, JobOptions},
    errors::ProcessingError,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserCreated {
    user_id: String,
    email: String,
}

#[derive(Default)]
struct WelcomeMailer {
    sent: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl EventConsumer for WelcomeMailer {
    fn queue_name(&self) -> &str {
        USER_CREATED_QUEUE
    }

    async fn process(&self, _ctx: &Context, event: &Envelope) -> Result<(), ProcessingError> {
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[tokio::test]
async fn emitted_event_reaches_subscribed_consumer() {
    let broker = Arc::new(MemoryBroker::new());
    let client = common::client(broker.clone()).await;
    let mailer = Arc::new(WelcomeMailer::default());

    client.subscribe(mailer.clone()).await.unwrap();

    let user = UserCreated {
        user_id: "u-1".into(),
        email: "ana@example.com".into(),
    };
    let emitted = client
        .emit("user_events", "user.created", &user)
        .await
        .unwrap();

    eventually(|| mailer.sent.lock().unwrap().len() == 1).await;

    let received = mailer.sent.lock().unwrap()[0].clone();
    assert_eq!(received.kind, "user.created");
    assert_eq!(received.metadata.origin_service, "auth");
    assert_eq!(received.metadata.correlation_id, emitted.metadata.correlation_id);
    assert_eq!(received.payload_as::<UserCreated>().unwrap(), user);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cleanup {
    older_than_days: u32,
}

#[derive(Default)]
struct CleanupWorker {
    runs: Mutex<Vec<u32>>,
}

#[async_trait]
impl JobWorker for CleanupWorker {
    type Payload = Cleanup;

    fn queue_name(&self) -> &str {
        JOBS_QUEUE
    }

    fn job_type(&self) -> &str {
        "user_cleanup"
    }

    async fn process(&self, _ctx: &Context, job: Cleanup) -> Result<(), ProcessingError> {
        self.runs.lock().unwrap().push(job.older_than_days);
        Ok(())
    }
}

#[tokio::test]
async fn submitted_jobs_are_decoded_for_the_worker() {
    let broker = Arc::new(MemoryBroker::new());
    let client = common::client(broker.clone()).await;
    let worker = Arc::new(CleanupWorker::default());

    client.subscribe_worker(worker.clone()).await.unwrap();

    let producer = client.producer("jobs_exchange");
    producer
        .submit_job(
            "jobs_exchange",
            "job.background",
            "user_cleanup",
            &serde_json::json!({ "olderThanDays": 90 }),
            JobOptions::default(),
        )
        .await
        .unwrap();
    producer
        .submit_job(
            "jobs_exchange",
            "job.background",
            "user_cleanup",
            &serde_json::json!({ "olderThanDays": "soon" }),
            JobOptions::default(),
        )
        .await
        .unwrap();

    eventually(|| broker.acks().len() + broker.nacks().len() == 2).await;
    settle().await;

    assert_eq!(*worker.runs.lock().unwrap(), vec![90]);
    // a malformed payload is terminal: dead-lettered without retry
    assert_eq!(broker.backlog(DEAD_LETTERS_QUEUE).len(), 1);
    assert!(broker.published_to("retry_exchange").is_empty());
}
