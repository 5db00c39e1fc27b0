// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker doubles for unit tests.

use crate::{
    channel::{closure_signal, BrokerLink, ClosureNotifier, ClosureSignal, Connector},
    delivery::{Acknowledger, Delivery, DeliveryMetadata, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) type DeliveryFeed = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

/// Records every settlement instead of talking to a broker.
#[derive(Default)]
pub(crate) struct RecordingAcker {
    acked: Mutex<Vec<u64>>,
    nacked: Mutex<Vec<(u64, bool)>>,
    rejected: Mutex<Vec<(u64, bool)>>,
}

impl RecordingAcker {
    pub(crate) fn acked(&self) -> Vec<u64> {
        self.acked.lock().unwrap().clone()
    }

    pub(crate) fn nacked(&self) -> Vec<(u64, bool)> {
        self.nacked.lock().unwrap().clone()
    }

    pub(crate) fn rejected(&self) -> Vec<(u64, bool)> {
        self.rejected.lock().unwrap().clone()
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.acked.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.nacked.lock().unwrap().push((delivery_tag, requeue));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.rejected.lock().unwrap().push((delivery_tag, requeue));
        Ok(())
    }
}

pub(crate) fn delivery(tag: u64, routing_key: &str, body: &[u8], acker: Arc<RecordingAcker>) -> Delivery {
    Delivery::new(
        body.to_vec(),
        tag,
        DeliveryMetadata {
            exchange: "events".to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: BasicProperties::default(),
        },
        acker,
    )
}

/// A delivery stream fed by the returned sender. It ends when the sender is dropped.
pub(crate) fn delivery_stream() -> (DeliveryFeed, DeliveryStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, stoppable_stream(rx, CancellationToken::new()))
}

fn stoppable_stream(
    rx: mpsc::UnboundedReceiver<Result<Delivery, AmqpError>>,
    stop: CancellationToken,
) -> DeliveryStream {
    stream::unfold((rx, stop), |(mut rx, stop)| async move {
        tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            item = rx.recv() => item.map(|item| (item, (rx, stop))),
        }
    })
    .boxed()
}

/// What the next connection attempt of a `FakeConnector` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    Accept,
    Refuse,
    FailQueueDeclare,
    /// The connection attempt never completes.
    Stall,
    /// Connects, then the queue declaration never completes.
    StallQueueDeclare,
}

/// Hands out `FakeLink`s following a script; once the script is exhausted every
/// attempt is accepted.
#[derive(Default)]
pub(crate) struct FakeConnector {
    script: Mutex<VecDeque<Attempt>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FakeConnector::default())
    }

    pub(crate) fn scripted(attempts: Vec<Attempt>) -> Arc<Self> {
        Arc::new(FakeConnector {
            script: Mutex::new(attempts.into()),
            ..FakeConnector::default()
        })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().unwrap().clone()
    }

    /// Waits until `count` links were handed out and returns them.
    pub(crate) async fn wait_for_links(&self, count: usize) -> Vec<Arc<FakeLink>> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let links = self.links();
                if links.len() >= count {
                    return links;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("links were not created in time")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn BrokerLink>, AmqpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let attempt = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Accept);

        match attempt {
            Attempt::Refuse => {
                return Err(AmqpError::ConnectionError("connection refused".to_owned()))
            }
            Attempt::Stall => std::future::pending::<()>().await,
            _ => {}
        }

        let link = Arc::new(FakeLink::new(attempt));
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

/// A link whose deliveries are pushed by the test and whose closure is triggered
/// with `kill`.
pub(crate) struct FakeLink {
    attempt: Attempt,
    feed: DeliveryFeed,
    deliveries: Mutex<Option<mpsc::UnboundedReceiver<Result<Delivery, AmqpError>>>>,
    stop: CancellationToken,
    notifier: ClosureNotifier,
    closure: Mutex<Option<ClosureSignal>>,
    calls: Mutex<Vec<String>>,
    closes: AtomicUsize,
    cancels: AtomicUsize,
}

impl FakeLink {
    fn new(attempt: Attempt) -> Self {
        let (feed, rx) = mpsc::unbounded_channel();
        let (notifier, signal) = closure_signal();
        FakeLink {
            attempt,
            feed,
            deliveries: Mutex::new(Some(rx)),
            stop: CancellationToken::new(),
            notifier,
            closure: Mutex::new(Some(signal)),
            calls: Mutex::new(vec![]),
            closes: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, delivery: Delivery) {
        let _ = self.feed.send(Ok(delivery));
    }

    /// Simulates the broker dropping the connection.
    pub(crate) fn kill(&self, reason: &str) {
        self.stop.cancel();
        self.notifier.notify(reason);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BrokerLink for FakeLink {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.record(format!("exchange {} {}", def.name, def.kind));
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.record(format!("queue {}", def.name));
        match self.attempt {
            Attempt::FailQueueDeclare => Err(AmqpError::DeclareQueueError(
                def.name.clone(),
                "PRECONDITION_FAILED".to_owned(),
            )),
            Attempt::StallQueueDeclare => std::future::pending().await,
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.record(format!(
            "bind {} {} {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        ));
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.record(format!("qos {prefetch_count}"));
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.record(format!("consume {queue} {consumer_tag}"));
        let rx = self
            .deliveries
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AmqpError::BindingConsumerError(consumer_tag.to_owned(), "already consuming".to_owned()))?;
        Ok(stoppable_stream(rx, self.stop.clone()))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.record("confirm".to_owned());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _payload: &[u8],
        _properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.record(format!("publish {exchange} {routing_key}"));
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.record(format!("cancel {consumer_tag}"));
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.stop.cancel();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.record("close".to_owned());
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.stop.cancel();
        Ok(())
    }

    fn closure(&self) -> Option<ClosureSignal> {
        self.closure.lock().unwrap().take()
    }
}
