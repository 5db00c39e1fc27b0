// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatcher
//!
//! The dispatcher fans deliveries from one delivery stream out to a fixed pool of
//! workers. Workers compete for the next delivery, so with more than one worker
//! ordering across workers is not guaranteed; with a single worker deliveries are
//! handled in FIFO order. Every worker runs until the stream ends, which happens
//! when the underlying channel closes or the consumer is cancelled.
//!
//! Handler failures (errors and panics) are logged and recorded on the consumer
//! span. They never reach the connection supervisor and nothing is acknowledged on
//! the handler's behalf.

use crate::{delivery::DeliveryStream, handler::ConsumerHandler, otel};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{debug, error, Instrument};

/// Worker count used when none is configured.
pub const DEFAULT_HANDLER_THREADS: usize = 1;

/// Runs a handler over a delivery stream with a fixed number of workers.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn ConsumerHandler>,
    threads: usize,
}

impl Dispatcher {
    /// Creates a new dispatcher.
    ///
    /// # Parameters
    /// * `handler` - Handler invoked for every delivery
    /// * `threads` - Number of concurrent handler invocations, zero is raised to one
    ///
    /// # Returns
    /// A new Dispatcher instance
    pub fn new(handler: Arc<dyn ConsumerHandler>, threads: usize) -> Self {
        Dispatcher {
            handler,
            threads: threads.max(1),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Spawns the worker pool over `deliveries` and returns its handle.
    ///
    /// Workers inherit the caller's tracing span.
    pub fn dispatch(&self, deliveries: DeliveryStream) -> Workers {
        let deliveries = Arc::new(Mutex::new(deliveries));
        let mut set = JoinSet::new();

        for worker in 0..self.threads {
            set.spawn(
                work(worker, deliveries.clone(), self.handler.clone())
                    .instrument(tracing::Span::current()),
            );
        }

        Workers { set }
    }
}

/// Handle on a running worker pool.
pub struct Workers {
    set: JoinSet<()>,
}

impl Workers {
    /// Waits until every worker observed the end of the delivery stream.
    pub async fn join(mut self) {
        while let Some(result) = self.set.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    error!(error = err.to_string(), "dispatcher worker panicked");
                }
            }
        }
    }
}

async fn work(
    worker: usize,
    deliveries: Arc<Mutex<DeliveryStream>>,
    handler: Arc<dyn ConsumerHandler>,
) {
    let tracer = global::tracer(otel::CONSUMER_TRACER);

    loop {
        let next = { deliveries.lock().await.next().await };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                error!(error = err.to_string(), worker, "errors consume msg");
                continue;
            }
            None => break,
        };

        let (ctx, mut span) = otel::new_span(
            &delivery.metadata.properties,
            &tracer,
            &delivery.metadata.routing_key,
        );

        debug!(
            worker,
            tag = delivery.delivery_tag,
            exchange = %delivery.metadata.exchange,
            routing_key = %delivery.metadata.routing_key,
            "received delivery"
        );

        let tag = delivery.delivery_tag;
        let outcome = AssertUnwindSafe(async { handler.handle(&ctx, delivery).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                span.set_status(Status::Ok);
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), worker, tag, "error consume msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
            Err(_) => {
                error!(worker, tag, "handler panicked");
                span.set_status(Status::Error {
                    description: Cow::from("handler panicked"),
                });
            }
        }
    }

    debug!(worker, "delivery stream closed, worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delivery::Delivery,
        errors::{AmqpError, HandlerError},
        handler::{handler_fn, MockConsumerHandler},
        testing::{delivery, delivery_stream, RecordingAcker},
    };
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn single_worker_keeps_fifo_order() {
        let (tx, stream) = delivery_stream();
        let acker = Arc::new(RecordingAcker::default());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let handler = handler_fn(move |d: Delivery| {
            let seen = seen_tx.clone();
            async move {
                let _ = seen.send(d.delivery_tag);
                Ok(())
            }
        });

        let workers = Dispatcher::new(handler, 1).dispatch(stream);
        for tag in 1..=5 {
            tx.send(Ok(delivery(tag, "events.a", b"x", acker.clone()))).unwrap();
        }
        drop(tx);
        workers.join().await;

        let mut seen = vec![];
        while let Ok(tag) = seen_rx.try_recv() {
            seen.push(tag);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn workers_run_concurrently_up_to_the_thread_count() {
        let (tx, stream) = delivery_stream();
        let acker = Arc::new(RecordingAcker::default());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handler = {
            let running = running.clone();
            let peak = peak.clone();
            handler_fn(move |_d: Delivery| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let workers = Dispatcher::new(handler, 3).dispatch(stream);
        for tag in 1..=9 {
            tx.send(Ok(delivery(tag, "events.a", b"x", acker.clone()))).unwrap();
        }
        drop(tx);
        workers.join().await;

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak > 1, "expected concurrent handlers, peak was {peak}");
        assert!(peak <= 3, "expected at most 3 concurrent handlers, peak was {peak}");
    }

    #[tokio::test]
    async fn handler_failures_do_not_stop_the_worker() {
        let (tx, stream) = delivery_stream();
        let acker = Arc::new(RecordingAcker::default());
        let handled = Arc::new(std::sync::Mutex::new(vec![]));

        let handler = {
            let handled = handled.clone();
            handler_fn(move |d: Delivery| {
                let handled = handled.clone();
                async move {
                    match d.delivery_tag {
                        1 => {
                            handled.lock().unwrap().push(1);
                            Err(HandlerError::new("boom"))
                        }
                        2 => panic!("handler bug"),
                        tag => {
                            handled.lock().unwrap().push(tag);
                            d.ack().await?;
                            Ok(())
                        }
                    }
                }
            })
        };

        let workers = Dispatcher::new(handler, 1).dispatch(stream);
        for tag in 1..=3 {
            tx.send(Ok(delivery(tag, "events.a", b"x", acker.clone()))).unwrap();
        }
        drop(tx);
        workers.join().await;

        assert_eq!(*handled.lock().unwrap(), vec![1, 3]);
        assert_eq!(acker.acked(), vec![3]);
    }

    #[tokio::test]
    async fn failed_deliveries_are_left_unsettled() {
        let (tx, stream) = delivery_stream();
        let acker = Arc::new(RecordingAcker::default());

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_handle()
            .times(2)
            .returning(|_, _| Err(HandlerError::new("invalid payload")));

        let workers = Dispatcher::new(Arc::new(handler), 2).dispatch(stream);
        tx.send(Ok(delivery(1, "events.a", b"x", acker.clone()))).unwrap();
        tx.send(Err(AmqpError::ConsumerError("frame error".to_owned()))).unwrap();
        tx.send(Ok(delivery(2, "events.b", b"y", acker.clone()))).unwrap();
        drop(tx);
        workers.join().await;

        assert!(acker.acked().is_empty());
        assert!(acker.nacked().is_empty());
        assert!(acker.rejected().is_empty());
    }

    #[tokio::test]
    async fn zero_threads_means_one_worker() {
        let dispatcher = Dispatcher::new(handler_fn(|_d: Delivery| async { Ok(()) }), 0);
        assert_eq!(dispatcher.threads(), 1);
    }
}
