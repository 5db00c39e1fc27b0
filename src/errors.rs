// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! `AmqpError` names the step that failed (connect, channel-open, exchange-declare,
//! queue-declare, queue-bind, qos, consume-start, publish, shutdown) and carries the
//! message reported by the broker library. `HandlerError` is what consumer handlers
//! return; it is logged by the dispatcher and never turned into a reconnect.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error enabling publisher confirms on a channel
    #[error("failure to enable publisher confirms: {0}")]
    ConfirmSelectError(String),

    /// Error publishing a message
    #[error("failure to publish to exchange `{0}`: {1}")]
    PublishingError(String, String),

    /// The broker refused a published message
    #[error("message published to exchange `{0}` was not confirmed")]
    PublishNotConfirmed(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`: {1}")]
    AckMessageError(u64, String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`: {1}")]
    NackMessageError(u64, String),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`: {1}")]
    RejectMessageError(u64, String),

    /// Error receiving a delivery from the broker
    #[error("failure to consume message: {0}")]
    ConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`: {1}")]
    CancelConsumerError(String, String),

    /// Error closing a channel or a connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// An exchange kind that is not known to the broker
    #[error("invalid exchange kind `{0}`")]
    InvalidExchangeKind(String),

    /// No bound service has the requested name
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// No bound service has a uri with the requested scheme
    #[error("no service found for scheme `{0}`")]
    NoMatchingService(String),

    /// A service was found but its credentials carry no usable uri
    #[error("service credentials not available: {0}")]
    ServiceCredentialsError(String),

    /// The service environment could not be read
    #[error("failure to read the service environment: {0}")]
    ServiceEnvironmentError(String),

    /// The service credentials have no `protocols` section
    #[error("no protocols section defined for service `{0}`")]
    NoProtocolsSection(String),

    /// The `protocols` section has no `management` entry
    #[error("no management section defined for service `{0}`")]
    NoManagementSection(String),

    /// A `protocols` or `management` section is not an object
    #[error("failure to decode {1} section of service `{0}`")]
    SectionDecodeError(String, String),

    /// The `management` section has no `uri`
    #[error("management uri not found for service `{0}`")]
    ManagementUriNotFound(String),

    /// The management `uri` is not a string
    #[error("management uri of service `{0}` is not a string")]
    ManagementUriNotString(String),

    /// `start` was called on a consumer that is already running
    #[error("consumer already started")]
    AlreadyStarted,

    /// The consumer has been shut down and cannot be started again
    #[error("consumer stopped")]
    ConsumerStopped,
}

/// Failure reported by a consumer handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler failure: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError(msg.into())
    }
}

impl From<AmqpError> for HandlerError {
    fn from(err: AmqpError) -> Self {
        HandlerError(err.to_string())
    }
}
