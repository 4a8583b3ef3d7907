// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Timers for backoff sleeps and handler timeouts, tied to a cancellation token so
//! shutdown interrupts waiting work.

use crate::errors::TaskError;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct TaskScope {
    token: CancellationToken,
}

impl TaskScope {
    pub fn new() -> TaskScope {
        TaskScope::default()
    }

    /// A scope cancelled together with this one, and cancellable on its own.
    pub fn child(&self) -> TaskScope {
        TaskScope {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Sleeps for `delay` unless the scope is cancelled first.
    pub async fn sleep(&self, delay: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(TaskError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Races `fut` against a timer of `limit`.
    ///
    /// Cancellation of the scope does not abort `fut`: work that already started is
    /// allowed to finish.
    pub async fn timeout<F: Future>(&self, limit: Duration, fut: F) -> Result<F::Output, TaskError> {
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TaskError::TimedOut(limit))
    }
}
