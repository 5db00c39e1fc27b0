// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Supervised RabbitMQ Consumer
//!
//! `Consumer` keeps one subscription alive for the lifetime of the process. It
//! owns the current broker link, the dispatcher and a supervisor task that waits
//! for the link to close unexpectedly, sleeps a fixed back-off and redoes the
//! whole connect, declare and consume sequence, forever, until `shutdown`.
//!
//! Failure reporting is asymmetric. `start` runs the first connect, declare and
//! consume cycle on the caller's task and returns its error. Every later failure
//! happens on the supervisor task and is only logged: a broker that is down at
//! boot fails the application, a broker that goes away later never does.
//!
//! ```text
//! Disconnected --start--> Connecting --> Declaring --> Consuming
//!      ^                     |              |              |
//!      +---- first attempt fails -----------+        closure signal
//!                                                          v
//!                      Connecting <--back-off elapses-- Reconnecting
//!
//! any --shutdown--> ShuttingDown --> Stopped
//! ```

use crate::{
    channel::{closure_signal, BrokerLink, ClosureSignal, Connector},
    config::ConsumerConfig,
    delivery::DeliveryStream,
    dispatcher::{Dispatcher, Workers},
    errors::AmqpError,
    locator::ServiceLocator,
    topology::Topology,
};
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Pause between a detected closure (or a failed reconnect) and the next attempt.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound for in-flight handlers to finish once their delivery stream ended.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for closing a link that shutdown abandoned mid-setup.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound `shutdown` waits for the supervisor task before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifecycle of a supervised consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Declaring,
    Consuming,
    Reconnecting,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A consumer that reconnects and redeclares its topology whenever the broker
/// link closes unexpectedly.
pub struct Consumer {
    supervisor: Arc<Supervisor>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

struct Supervisor {
    uri: String,
    topology: Topology,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    backoff: Duration,
    state: watch::Sender<SupervisorState>,
    link: Mutex<Option<Arc<dyn BrokerLink>>>,
    pending: Mutex<Option<Arc<dyn BrokerLink>>>,
    shutdown: CancellationToken,
    span: Span,
}

/// A live link being consumed: what the supervisor watches.
struct Session {
    closure: ClosureSignal,
    workers: Workers,
}

impl Consumer {
    /// Creates a consumer. Nothing is connected until `start`.
    ///
    /// # Parameters
    /// * `uri` - Connection uri of the broker
    /// * `topology` - Exchange, queue, binding and consumer tag, redeclared on every reconnect
    /// * `dispatcher` - Worker pool running the handler
    /// * `connector` - Opens broker links
    ///
    /// # Returns
    /// A `Disconnected` consumer
    pub fn new(
        uri: &str,
        topology: Topology,
        dispatcher: Dispatcher,
        connector: Arc<dyn Connector>,
    ) -> Consumer {
        let span = info_span!(
            "amqp_consumer",
            queue = %topology.queue().name(),
            exchange = %topology.exchange().name(),
            consumer_tag = %topology.consumer_tag(),
        );
        let (state, _) = watch::channel(SupervisorState::Disconnected);

        Consumer {
            supervisor: Arc::new(Supervisor {
                uri: uri.to_owned(),
                topology,
                connector,
                dispatcher,
                backoff: RECONNECT_BACKOFF,
                state,
                link: Mutex::new(None),
                pending: Mutex::new(None),
                shutdown: CancellationToken::new(),
                span,
            }),
            task: AsyncMutex::new(None),
        }
    }

    /// Builds a consumer from its configuration, resolving the broker uri with
    /// `locator`.
    pub fn from_config(
        config: ConsumerConfig,
        locator: &dyn ServiceLocator,
        connector: Arc<dyn Connector>,
    ) -> Result<Consumer, AmqpError> {
        let uri = config.resolve_uri(locator)?;
        let topology = config.topology();
        let dispatcher = config.dispatcher();

        Ok(Consumer::new(&uri, topology, dispatcher, connector))
    }

    /// Overrides the reconnect back-off. Only effective before `start`.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        match Arc::get_mut(&mut self.supervisor) {
            Some(supervisor) => supervisor.backoff = backoff,
            None => warn!("back-off ignored, consumer already started"),
        }
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.supervisor.topology
    }

    pub fn state(&self) -> SupervisorState {
        *self.supervisor.state.borrow()
    }

    /// Returns a receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.supervisor.state.subscribe()
    }

    /// Connects, declares the topology and starts consuming.
    ///
    /// Only this first attempt is reported: on failure the consumer stays
    /// `Disconnected` and does not retry until `start` is called again. Once it
    /// succeeded, closures are handled by the background supervisor.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - The error of the failing step, `AlreadyStarted`
    ///   if the consumer runs, or `ConsumerStopped` after `shutdown`
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut task = self.task.lock().await;

        if self.supervisor.shutdown.is_cancelled() {
            return Err(AmqpError::ConsumerStopped);
        }
        if task.is_some() {
            return Err(AmqpError::AlreadyStarted);
        }

        let supervisor = self.supervisor.clone();
        let span = supervisor.span.clone();

        let (link, deliveries) = match supervisor.establish().instrument(span.clone()).await {
            Ok(established) => established,
            Err(err) => {
                supervisor.transition(SupervisorState::Disconnected);
                return Err(err);
            }
        };

        let session = match supervisor.activate(link, deliveries) {
            Ok(session) => session,
            Err(link) => {
                if let Err(err) = link.close().await {
                    debug!(parent: &span, error = err.to_string(), "failure to close link");
                }
                return Err(AmqpError::ConsumerStopped);
            }
        };
        *task = Some(tokio::spawn(supervisor.supervise(session).instrument(span)));

        Ok(())
    }

    /// Stops consuming and closes the link.
    ///
    /// The consumer tag is cancelled first so no new deliveries arrive, then the
    /// worker pool is drained and finally channel and connection are closed. The
    /// link is closed exactly once even if a reconnect is in flight; calling
    /// `shutdown` again is a no-op.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        let mut task = self.task.lock().await;
        let supervisor = &self.supervisor;

        if self.state() == SupervisorState::Stopped {
            debug!(parent: &supervisor.span, "consumer already stopped");
            return Ok(());
        }

        supervisor.transition(SupervisorState::ShuttingDown);
        supervisor.shutdown.cancel();

        let link = supervisor.take_link();
        let mut result = Ok(());

        if let Some(link) = &link {
            if let Err(err) = link.cancel(supervisor.topology.consumer_tag()).await {
                warn!(parent: &supervisor.span, error = err.to_string(), "failure to cancel consumer");
                result = Err(err);
            }
        }

        if let Some(mut handle) = task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
                Ok(Err(err)) => {
                    error!(parent: &supervisor.span, error = err.to_string(), "supervisor task failed");
                }
                Err(_) => {
                    warn!(parent: &supervisor.span, "supervisor task did not stop in time, aborting it");
                    handle.abort();
                    if let Some(pending) = supervisor.take_pending() {
                        supervisor.close_abandoned(pending).await;
                    }
                }
                Ok(Ok(())) => {}
            }
        }

        if let Some(link) = link {
            if let Err(err) = link.close().await {
                warn!(parent: &supervisor.span, error = err.to_string(), "failure to close link");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        supervisor.transition(SupervisorState::Stopped);
        info!(parent: &supervisor.span, "consumer stopped");

        result
    }
}

impl Supervisor {
    /// Runs one connect, declare and consume cycle. A link that was opened but
    /// could not be set up is closed before the error is returned.
    ///
    /// Until `activate` takes it over, the opened link is parked in `pending` so a
    /// shutdown interrupting the cycle can still close it.
    async fn establish(&self) -> Result<(Arc<dyn BrokerLink>, DeliveryStream), AmqpError> {
        self.transition(SupervisorState::Connecting);
        let link = self.connector.connect(&self.uri).await?;
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(link.clone());

        self.transition(SupervisorState::Declaring);
        match self.declare(link.as_ref()).await {
            Ok(deliveries) => Ok((link, deliveries)),
            Err(err) => {
                self.take_pending();
                if let Err(close_err) = link.close().await {
                    debug!(error = close_err.to_string(), "failure to close link after setup error");
                }
                Err(err)
            }
        }
    }

    async fn declare(&self, link: &dyn BrokerLink) -> Result<DeliveryStream, AmqpError> {
        self.topology.install(link).await?;

        info!(
            consumer_tag = self.topology.consumer_tag(),
            "queue bound to exchange, starting consume"
        );
        link.consume(self.topology.queue().name(), self.topology.consumer_tag())
            .await
    }

    /// Publishes a freshly established link and starts dispatching its deliveries.
    ///
    /// The shutdown check and the publication happen under the link lock, so a
    /// link is either visible to `shutdown` or handed back to the caller to close.
    fn activate(
        &self,
        link: Arc<dyn BrokerLink>,
        deliveries: DeliveryStream,
    ) -> Result<Session, Arc<dyn BrokerLink>> {
        let _entered = self.span.enter();
        self.take_pending();

        {
            let mut slot = self.link.lock().unwrap_or_else(PoisonError::into_inner);
            if self.shutdown.is_cancelled() {
                return Err(link);
            }
            *slot = Some(link.clone());
        }

        let closure = link.closure().unwrap_or_else(|| {
            error!("link has no closure signal, treating it as closed");
            let (_, signal) = closure_signal();
            signal
        });

        let workers = self.dispatcher.dispatch(deliveries);
        self.transition(SupervisorState::Consuming);

        Ok(Session { closure, workers })
    }

    async fn supervise(self: Arc<Self>, mut session: Session) {
        loop {
            let reason = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.drain(session.workers).await;
                    return;
                }
                reason = &mut session.closure => reason,
            };

            warn!(
                reason = %reason,
                backoff = ?self.backoff,
                "amqp link closed unexpectedly, reconnecting"
            );
            self.transition(SupervisorState::Reconnecting);

            if let Some(dead) = self.take_link() {
                if let Err(err) = dead.close().await {
                    debug!(error = err.to_string(), "failure to close dead link");
                }
            }
            self.drain(session.workers).await;

            session = match self.reconnect().await {
                Some(session) => session,
                None => return,
            };
        }
    }

    /// Retries the full cycle after every back-off until it succeeds or the
    /// consumer is shut down. Shutdown interrupts both the back-off and a cycle
    /// in progress.
    async fn reconnect(&self) -> Option<Session> {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.backoff) => {}
            }

            let established = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    if let Some(pending) = self.take_pending() {
                        self.close_abandoned(pending).await;
                    }
                    return None;
                }
                established = self.establish() => established,
            };

            let (link, deliveries) = match established {
                Ok(established) => established,
                Err(err) => {
                    error!(error = err.to_string(), "could not reconnect");
                    self.transition(SupervisorState::Reconnecting);
                    continue;
                }
            };

            match self.activate(link, deliveries) {
                Ok(session) => {
                    info!("reconnected");
                    return Some(session);
                }
                Err(link) => {
                    if let Err(err) = link.close().await {
                        debug!(error = err.to_string(), "failure to close link opened during shutdown");
                    }
                    return None;
                }
            }
        }
    }

    async fn drain(&self, workers: Workers) {
        if tokio::time::timeout(DRAIN_TIMEOUT, workers.join())
            .await
            .is_err()
        {
            warn!("handlers still running after drain timeout, aborting them");
        }
    }

    fn take_pending(&self) -> Option<Arc<dyn BrokerLink>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close_abandoned(&self, link: Arc<dyn BrokerLink>) {
        match tokio::time::timeout(CLOSE_TIMEOUT, link.close()).await {
            Ok(Err(err)) => debug!(error = err.to_string(), "failure to close abandoned link"),
            Err(_) => warn!("abandoned link did not close in time"),
            Ok(Ok(())) => debug!("closed link abandoned by shutdown"),
        }
    }

    fn take_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Moves to `next`, except that nothing but `Stopped` follows a shutdown.
    fn transition(&self, next: SupervisorState) {
        let changed = self.state.send_if_modified(|state| {
            let shutting_down = matches!(
                *state,
                SupervisorState::ShuttingDown | SupervisorState::Stopped
            );
            if *state == next || (shutting_down && next != SupervisorState::Stopped) {
                return false;
            }
            *state = next;
            true
        });

        if changed {
            debug!(parent: &self.span, state = %next, "consumer state changed");
        }
    }
}
