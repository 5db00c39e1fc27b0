// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Topology
//!
//! The topology is the set of declarations a consumer needs before messages can
//! flow: one exchange, one queue, the binding between them and the consumer tag.
//! It is immutable once a session starts and is replayed verbatim on every
//! reconnect; the broker's declare semantics make the replay a no-op when the
//! entities already exist, and recreate them when a failover node lacks them.

use crate::{
    channel::BrokerLink,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// Number of unacknowledged deliveries a consumer channel holds at once.
pub const PREFETCH_COUNT: u16 = 1;

/// Exchange, queue, binding key and consumer tag of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    binding: QueueBinding,
    consumer_tag: String,
}

impl Topology {
    /// Creates a topology for a durable exchange and a durable queue bound to it.
    pub fn new(
        exchange_name: &str,
        exchange_kind: ExchangeKind,
        queue_name: &str,
        binding_key: &str,
        consumer_tag: &str,
    ) -> Topology {
        Topology {
            exchange: ExchangeDefinition::new(exchange_name).kind(exchange_kind),
            queue: QueueDefinition::new(queue_name),
            binding: QueueBinding::new(queue_name)
                .exchange(exchange_name)
                .routing_key(binding_key),
            consumer_tag: consumer_tag.to_owned(),
        }
    }

    /// Replaces the exchange definition, keeping the binding pointed at it.
    pub fn with_exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.binding = self.binding.exchange(&exchange.name);
        self.exchange = exchange;
        self
    }

    /// Replaces the queue definition, keeping the binding pointed at it.
    pub fn with_queue(mut self, queue: QueueDefinition) -> Self {
        self.binding.queue_name = queue.name.clone();
        self.queue = queue;
        self
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Declares the exchange on the link.
    pub async fn declare_exchange(&self, link: &dyn BrokerLink) -> Result<(), AmqpError> {
        link.declare_exchange(&self.exchange).await
    }

    /// Declares the queue, fixes the prefetch limit and binds the queue to the
    /// exchange, in that order. The first failing step aborts the sequence.
    pub async fn declare_queue(&self, link: &dyn BrokerLink) -> Result<(), AmqpError> {
        link.declare_queue(&self.queue).await?;
        link.qos(PREFETCH_COUNT).await?;
        link.bind_queue(&self.binding).await?;

        debug!(
            queue = %self.queue.name,
            exchange = %self.exchange.name,
            key = %self.binding.routing_key,
            "queue was bound"
        );
        Ok(())
    }

    /// Runs the full declaration: exchange, queue, qos and binding.
    pub async fn install(&self, link: &dyn BrokerLink) -> Result<(), AmqpError> {
        self.declare_exchange(link).await?;
        self.declare_queue(link).await
    }
}
