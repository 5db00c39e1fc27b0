// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ consumers and producers built on lapin.
//!
//! A [`Consumer`] declares its topology, consumes with a prefetch of one and
//! hands each delivery to a [`ConsumerHandler`] running on a pool of workers.
//! When the connection drops it reconnects after a fixed back-off until it is
//! shut down. A [`Producer`] publishes to one declared exchange with publisher
//! confirms enabled.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod locator;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use channel::{AmqpConnector, BrokerLink, Connector};
pub use config::{ConsumerConfig, ProducerConfig};
pub use consumer::{Consumer, SupervisorState};
pub use delivery::{Delivery, DeliveryMetadata};
pub use dispatcher::Dispatcher;
pub use errors::{AmqpError, HandlerError};
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use handler::{handler_fn, ConsumerHandler, DummyHandler};
pub use locator::{ServiceLocator, VcapServices};
pub use publisher::{HeaderValues, Producer, PublishMessage};
pub use queue::{QueueBinding, QueueDefinition};
pub use topology::Topology;
