// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler receives a decoded envelope and answers with an explicit result: `Ok(())`
//! acknowledges the message, a retryable [`ProcessingError`] schedules a delayed retry,
//! and a terminal one rejects the message without requeue.

use crate::{envelope::Envelope, errors::ProcessingError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{future::Future, marker::PhantomData, sync::Arc};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, envelope: &Envelope) -> Result<(), ProcessingError>;
}

/// Adapts an async closure over an owned envelope into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    async fn handle(&self, _ctx: &Context, envelope: &Envelope) -> Result<(), ProcessingError> {
        (self.f)(envelope.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closure_handler_receives_envelope() {
        let handler = handler_fn(|envelope: Envelope| async move {
            if envelope.payload["ok"] == true {
                Ok(())
            } else {
                Err(ProcessingError::terminal("not ok"))
            }
        });

        let ok = Envelope::new("check", json!({ "ok": true }));
        let bad = Envelope::new("check", json!({ "ok": false }));

        assert_eq!(handler.handle(&Context::new(), &ok).await, Ok(()));
        assert!(handler.handle(&Context::new(), &bad).await.is_err());
    }
}
