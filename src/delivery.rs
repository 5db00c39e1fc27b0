// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! A `Delivery` is one message handed to a consumer handler. The handler decides
//! its fate: it acknowledges, negative-acknowledges or rejects it through the
//! delivery tag. Nothing in this crate settles a delivery on the handler's behalf.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    BasicProperties, Channel,
};
use std::{fmt, sync::Arc};

/// The broker-fed sequence of deliveries. It ends when the underlying channel closes
/// or the consumer is cancelled.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Settles deliveries by tag on the channel they arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// Envelope information that came with a delivery.
#[derive(Debug, Clone, Default)]
pub struct DeliveryMetadata {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
}

/// One message received from a queue.
#[derive(Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub metadata: DeliveryMetadata,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        delivery_tag: u64,
        metadata: DeliveryMetadata,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            body,
            delivery_tag,
            metadata,
            acker,
        }
    }

    pub(crate) fn from_lapin(delivery: lapin::message::Delivery, acker: Arc<dyn Acknowledger>) -> Self {
        Delivery {
            body: delivery.data,
            delivery_tag: delivery.delivery_tag,
            metadata: DeliveryMetadata {
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                properties: delivery.properties,
            },
            acker,
        }
    }

    /// Acknowledges this delivery.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Negative-acknowledges this delivery, optionally putting it back on the queue.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(self.delivery_tag, requeue).await
    }

    /// Rejects this delivery, optionally putting it back on the queue.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("metadata", &self.metadata)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Acknowledges through the lapin channel the delivery was received on.
pub(crate) struct ChannelAcknowledger {
    channel: Channel,
}

impl ChannelAcknowledger {
    pub(crate) fn new(channel: Channel) -> Self {
        ChannelAcknowledger { channel }
    }
}

#[async_trait]
impl Acknowledger for ChannelAcknowledger {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(delivery_tag, err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(delivery_tag, err.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(delivery_tag, err.to_string()))
    }
}
