// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Routes envelopes to handlers by their `type`. Typed registrations deserialize the
//! payload into the handler's own type before dispatch, so a malformed payload is rejected
//! at the boundary as a terminal failure instead of reaching business code.

use crate::{envelope::Envelope, errors::ProcessingError, handler::MessageHandler};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, future::Future, marker::PhantomData, sync::Arc};
use tracing::{debug, warn};

/// Type-keyed handler registry; itself a [`MessageHandler`] that can be consumed from a queue.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Registers a handler for envelopes of type `kind`. Registering a type twice
    /// replaces the previous handler.
    pub fn register(mut self, kind: &str, handler: Arc<dyn MessageHandler>) -> Self {
        if self.handlers.insert(kind.to_owned(), handler).is_some() {
            warn!(kind, "replacing handler already registered for message type");
        }
        self
    }

    /// Registers a typed handler: the payload is decoded into `T` before `f` runs.
    pub fn on<T, F, Fut>(self, kind: &str, f: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
    {
        self.register(
            kind,
            Arc::new(TypedHandler {
                f,
                _marker: PhantomData,
            }),
        )
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, ctx: &Context, envelope: &Envelope) -> Result<(), ProcessingError> {
        let Some(handler) = self.handlers.get(&envelope.kind) else {
            debug!(
                kind = envelope.kind,
                "rejecting message - reason: unsupported msg type"
            );
            return Err(ProcessingError::UnsupportedType(envelope.kind.clone()));
        };

        handler.handle(ctx, envelope).await
    }
}

struct TypedHandler<T, F, Fut> {
    f: F,
    _marker: PhantomData<fn(T) -> Fut>,
}

#[async_trait]
impl<T, F, Fut> MessageHandler for TypedHandler<T, F, Fut>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    async fn handle(&self, _ctx: &Context, envelope: &Envelope) -> Result<(), ProcessingError> {
        let payload = envelope.payload_as::<T>()?;
        (self.f)(payload).await
    }
}
