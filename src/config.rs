// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer and Producer Configuration
//!
//! Boundary inputs for building consumers and producers. The broker uri is not
//! configured directly: `service_name` is looked up with a `ServiceLocator`, and
//! without one the first bound `amqp://` service is used.

use crate::{
    dispatcher::{Dispatcher, DEFAULT_HANDLER_THREADS},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::ConsumerHandler,
    locator::ServiceLocator,
    topology::Topology,
};
use std::{fmt, sync::Arc};

/// Scheme used to pick a broker when no service name is configured.
pub const AMQP_SCHEME: &str = "amqp";

fn resolve_service_uri(
    locator: &dyn ServiceLocator,
    service_name: &str,
) -> Result<String, AmqpError> {
    if service_name.is_empty() {
        locator.resolve_first_matching(AMQP_SCHEME)
    } else {
        locator.resolve(service_name)
    }
}

/// Configuration of a supervised consumer.
#[derive(Clone)]
pub struct ConsumerConfig {
    pub service_name: String,
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    pub queue_name: String,
    pub routing_key: String,
    pub consumer_tag: String,
    pub handler_thread_count: usize,
    pub handler: Arc<dyn ConsumerHandler>,
}

impl ConsumerConfig {
    /// Starts a configuration for `handler` with one handler thread and a direct
    /// exchange.
    pub fn new(handler: Arc<dyn ConsumerHandler>) -> Self {
        ConsumerConfig {
            service_name: String::new(),
            exchange_name: String::new(),
            exchange_kind: ExchangeKind::Direct,
            queue_name: String::new(),
            routing_key: String::new(),
            consumer_tag: String::new(),
            handler_thread_count: DEFAULT_HANDLER_THREADS,
            handler,
        }
    }

    /// Sets the bound service the broker uri is resolved from. When left empty
    /// the first `amqp://` service is used.
    pub fn service_name(mut self, name: &str) -> Self {
        self.service_name = name.to_owned();
        self
    }

    /// Sets the exchange the queue is bound to.
    ///
    /// # Parameters
    /// * `name` - Exchange name
    /// * `kind` - Exchange kind (topic, direct, fanout, ...)
    pub fn exchange(mut self, name: &str, kind: ExchangeKind) -> Self {
        self.exchange_name = name.to_owned();
        self.exchange_kind = kind;
        self
    }

    /// Sets the queue to consume from.
    pub fn queue(mut self, name: &str) -> Self {
        self.queue_name = name.to_owned();
        self
    }

    /// Sets the binding key between exchange and queue.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Sets the tag the consumer identifies itself with to the broker.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    /// Sets how many deliveries are handled concurrently. Zero counts as one.
    pub fn handler_thread_count(mut self, threads: usize) -> Self {
        self.handler_thread_count = threads;
        self
    }

    /// Resolves the broker uri.
    ///
    /// # Parameters
    /// * `locator` - Service locator asked for the configured service
    ///
    /// # Returns
    /// * `Result<String, AmqpError>` - The connection uri, or the locator's error
    pub fn resolve_uri(&self, locator: &dyn ServiceLocator) -> Result<String, AmqpError> {
        resolve_service_uri(locator, &self.service_name)
    }

    /// The topology declared on every (re)connect.
    pub fn topology(&self) -> Topology {
        Topology::new(
            &self.exchange_name,
            self.exchange_kind.clone(),
            &self.queue_name,
            &self.routing_key,
            &self.consumer_tag,
        )
    }

    /// A dispatcher running the configured handler.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.handler.clone(), self.handler_thread_count)
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("service_name", &self.service_name)
            .field("exchange_name", &self.exchange_name)
            .field("exchange_kind", &self.exchange_kind)
            .field("queue_name", &self.queue_name)
            .field("routing_key", &self.routing_key)
            .field("consumer_tag", &self.consumer_tag)
            .field("handler_thread_count", &self.handler_thread_count)
            .finish_non_exhaustive()
    }
}

/// Configuration of a producer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerConfig {
    pub service_name: String,
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
}

impl ProducerConfig {
    /// Creates a producer configuration for the given exchange.
    pub fn new(exchange_name: &str, exchange_kind: ExchangeKind) -> Self {
        ProducerConfig {
            service_name: String::new(),
            exchange_name: exchange_name.to_owned(),
            exchange_kind,
        }
    }

    /// Sets the bound service the broker uri is resolved from.
    pub fn service_name(mut self, name: &str) -> Self {
        self.service_name = name.to_owned();
        self
    }

    /// Resolves the broker uri, see [`ConsumerConfig::resolve_uri`].
    pub fn resolve_uri(&self, locator: &dyn ServiceLocator) -> Result<String, AmqpError> {
        resolve_service_uri(locator, &self.service_name)
    }

    /// The durable exchange the producer declares.
    pub fn exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.exchange_name).kind(self.exchange_kind.clone())
    }
}
