// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A handler receives one delivery at a time and settles it itself. The dispatcher
//! may run the same handler concurrently for different deliveries, so handlers are
//! shared behind an `Arc` and must be `Send + Sync`.

use crate::{delivery::Delivery, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{future::Future, sync::Arc};
use tracing::debug;

/// Processes deliveries taken from a queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Handles one delivery. `ctx` carries the trace context propagated by the publisher.
    async fn handle(&self, ctx: &Context, delivery: Delivery) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a handler.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` so it can be used wherever a `ConsumerHandler` is expected.
///
/// ```ignore
/// let handler = handler_fn(|delivery: Delivery| async move {
///     delivery.ack().await?;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, _ctx: &Context, delivery: Delivery) -> Result<(), HandlerError> {
        (self.f)(delivery).await
    }
}

/// Reference handler that acknowledges every delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyHandler;

#[async_trait]
impl ConsumerHandler for DummyHandler {
    async fn handle(&self, _ctx: &Context, delivery: Delivery) -> Result<(), HandlerError> {
        debug!(
            tag = delivery.delivery_tag,
            routing_key = %delivery.metadata.routing_key,
            "dummy handler acknowledging delivery"
        );
        delivery.ack().await?;
        Ok(())
    }
}
