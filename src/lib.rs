// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod contracts;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod producer;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod task;
pub mod topology;
pub mod worker;
