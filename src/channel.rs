// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! A `BrokerLink` is one physical connection plus one channel over it. It knows how
//! to declare an exchange, declare and bind a queue, set the prefetch limit, start
//! consuming, publish and close. A link is created fresh on every (re)connect and
//! discarded on any closure; it is never reused after its closure signal fired.
//!
//! The `Connector` trait opens links, which is where tests substitute the broker.

use crate::{
    delivery::{ChannelAcknowledger, Delivery, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll},
};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Reply code used for client-initiated closes.
const REPLY_SUCCESS: u16 = 200;

/// Creates the sending and receiving halves of a link closure notification.
pub fn closure_signal() -> (ClosureNotifier, ClosureSignal) {
    let (tx, rx) = oneshot::channel();
    (
        ClosureNotifier {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ClosureSignal { rx },
    )
}

/// Reports an unexpected closure of a link. Only the first report is delivered.
#[derive(Clone)]
pub struct ClosureNotifier {
    tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl ClosureNotifier {
    pub fn notify(&self, reason: impl Into<String>) {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(tx) = sender {
            let _ = tx.send(reason.into());
        }
    }
}

/// Resolves with the closure reason once the owning link closed unexpectedly.
///
/// If every notifier is dropped without reporting, the signal resolves as well:
/// a link that can no longer report is treated as closed.
pub struct ClosureSignal {
    rx: oneshot::Receiver<String>,
}

impl Future for ClosureSignal {
    type Output = String;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reason| reason.unwrap_or_else(|_| "link dropped".to_owned()))
    }
}

/// One connection and one channel to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries on the channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Takes the closure signal of this link. Returns `None` once taken.
    fn closure(&self) -> Option<ClosureSignal>;
}

/// Opens broker links.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerLink>, AmqpError>;
}

/// Opens lapin-backed links, naming every connection.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(connection_name: &str) -> Self {
        AmqpConnector {
            connection_name: connection_name.to_owned(),
        }
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        AmqpConnector::new(env!("CARGO_PKG_NAME"))
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerLink>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (notifier, signal) = closure_signal();
        let conn_notifier = notifier.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection closed");
            conn_notifier.notify(err.to_string());
        });

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                if let Err(close_err) = conn.close(REPLY_SUCCESS, "channel failure").await {
                    warn!(error = close_err.to_string(), "failure to close connection");
                }
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        channel.on_error(move |err| {
            warn!(error = err.to_string(), "amqp channel closed");
            notifier.notify(err.to_string());
        });

        Ok(Arc::new(AmqpLink {
            connection: conn,
            channel,
            closure: Mutex::new(Some(signal)),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A lapin connection with its single channel.
pub struct AmqpLink {
    connection: Connection,
    channel: Channel,
    closure: Mutex<Option<ClosureSignal>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerLink for AmqpLink {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(
                    def.name.clone(),
                    err.to_string(),
                ))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone(), err.to_string()))
            }
            Ok(queue) => {
                debug!(
                    messages = queue.message_count(),
                    consumers = queue.consumer_count(),
                    "queue: {} was created",
                    def.name
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                    err.to_string(),
                )
            })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(
                    consumer_tag.to_owned(),
                    err.to_string(),
                ))
            }
            Ok(c) => Ok(c),
        }?;

        let acker = Arc::new(ChannelAcknowledger::new(self.channel.clone()));

        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(Delivery::from_lapin(delivery, acker.clone())),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ConfirmSelectError(err.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(exchange.to_owned(), err.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|err| AmqpError::PublishingError(exchange.to_owned(), err.to_string()))?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishNotConfirmed(exchange.to_owned()));
        }

        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::CancelConsumerError(consumer_tag.to_owned(), err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channel_result = if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|err| AmqpError::CloseError(err.to_string()))
        } else {
            Ok(())
        };

        let connection_result = if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|err| AmqpError::CloseError(err.to_string()))
        } else {
            Ok(())
        };

        channel_result.and(connection_result)
    }

    fn closure(&self) -> Option<ClosureSignal> {
        self.closure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
