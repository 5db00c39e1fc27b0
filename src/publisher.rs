// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! A `Producer` owns one broker link restricted to publishing. It declares its
//! exchange once when created and enables publisher confirms, so a publish that
//! the broker refuses, for instance to an exchange that does not exist, fails on
//! the spot. There is no reconnect supervision: a publish on a broken link
//! returns its error and retrying is up to the caller.

use crate::{
    channel::{BrokerLink, Connector},
    config::ProducerConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    locator::ServiceLocator,
    otel,
};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Values accepted as custom message headers.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
    LongUint(u32),
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub data: Vec<u8>,
    pub content_type: String,
    pub msg_type: Option<String>,
    pub headers: HashMap<String, HeaderValues>,
}

impl PublishMessage {
    /// A JSON message carrying `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        PublishMessage {
            data: data.into(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            msg_type: None,
            headers: HashMap::default(),
        }
    }

    /// Overrides the content type.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    /// Sets the message type property.
    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    /// Adds a custom header.
    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }
}

/// Publishes messages over a single broker link.
pub struct Producer {
    link: Arc<dyn BrokerLink>,
    exchange: ExchangeDefinition,
}

impl Producer {
    /// Connects to the broker, enables publisher confirms and declares the exchange.
    ///
    /// # Parameters
    /// * `uri` - Connection uri of the broker
    /// * `exchange` - Exchange declared once for this producer
    /// * `connector` - Opens the broker link
    ///
    /// # Returns
    /// * `Result<Producer, AmqpError>` - The ready producer. On a setup failure the
    ///   link is closed again before the error is returned.
    pub async fn connect(
        uri: &str,
        exchange: ExchangeDefinition,
        connector: &dyn Connector,
    ) -> Result<Producer, AmqpError> {
        let link = connector.connect(uri).await?;

        let setup = async {
            link.confirm_select().await?;
            link.declare_exchange(&exchange).await
        };

        if let Err(err) = setup.await {
            error!(error = err.to_string(), "failure to set up producer");
            if let Err(close_err) = link.close().await {
                warn!(error = close_err.to_string(), "failure to close producer link");
            }
            return Err(err);
        }

        debug!(exchange = %exchange.name(), "producer ready");
        Ok(Producer { link, exchange })
    }

    /// Builds a producer from its configuration, resolving the broker uri with
    /// `locator`.
    pub async fn from_config(
        config: &ProducerConfig,
        locator: &dyn ServiceLocator,
        connector: &dyn Connector,
    ) -> Result<Producer, AmqpError> {
        let uri = config.resolve_uri(locator)?;
        Producer::connect(&uri, config.exchange(), connector).await
    }

    /// The exchange declared when the producer was created.
    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    /// Publishes a message.
    ///
    /// The current trace context is propagated in the message headers. Errors are
    /// returned as they happen, never retried.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange
    /// * `routing_key` - Routing key of the message
    /// * `message` - Payload, content type, type and custom headers
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `Ok` once the broker confirmed the message
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &PublishMessage,
    ) -> Result<(), AmqpError> {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(&Context::current(), &mut btree);
        btree_map(&message.headers, &mut btree);

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.clone()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree));

        if let Some(msg_type) = &message.msg_type {
            properties = properties.with_kind(ShortString::from(msg_type.clone()));
        }

        match self
            .link
            .publish(exchange, routing_key, &message.data, properties)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                Err(err)
            }
            _ => Ok(()),
        }
    }

    /// Closes the channel and the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.link.close().await
    }
}

/// Converts custom header values into AMQP values.
fn btree_map(hash_map: &HashMap<String, HeaderValues>, btree: &mut BTreeMap<ShortString, AMQPValue>) {
    for (key, value) in hash_map {
        let amqp_value = match value.clone() {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }
}
