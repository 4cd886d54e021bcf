//! Consumer loop
//!
//! Long-running worker that drains the durable work queue:
//!
//! ```text
//! Connecting -> Subscribed -> Processing -> Subscribed -> ...
//!      any state -> Terminated (cancellation or fatal error)
//! ```
//!
//! - Connecting goes through the supervisor's bounded retry.
//! - Subscribed declares the queue durable, sets prefetch to 1 and waits.
//! - Processing runs the `Processor` to completion, then acks. The ack is
//!   only ever sent after the processor (and therefore the sink append) has
//!   succeeded. A crash in between means the broker redelivers and the record
//!   is written twice, which at-least-once delivery accepts.
//! - A failed delivery is rejected with requeue so the broker hands it out
//!   again. No record is written for it.
//! - Losing the connection while subscribed sends the loop back to
//!   Connecting. A queue declaration conflict is fatal.
//!
//! Cancellation is only observed while waiting; a message being processed is
//! always finished (appended and acked) before the connection is closed.

mod processor;

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::broker::{BrokerConnection, Connector, Delivery};
use crate::supervisor::{self, RetryPolicy};
use crate::utils::{ErrorKind, RelayError, RelayResult};

pub use processor::{Processor, SinkProcessor};

/// At most one unacknowledged message per consumer.
pub const PREFETCH: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Subscribed,
    Processing,
    Terminated,
}

/// Why a subscribed session ended without a fatal error.
enum SessionEnd {
    Cancelled,
    ConnectionLost(RelayError),
}

pub struct ConsumerLoop<C> {
    connector: C,
    queue: String,
    policy: RetryPolicy,
    failure_pause: Duration,
    state: watch::Sender<ConsumerState>,
    span: Span,
}

impl<C: Connector> ConsumerLoop<C> {
    pub fn new(connector: C, queue: impl Into<String>, policy: RetryPolicy) -> Self {
        let queue = queue.into();
        let span = info_span!("consumer", queue = %queue);
        Self::with_span(connector, queue, policy, span)
    }

    /// Uses `span` as the logging context for the whole run.
    pub fn with_span(
        connector: C,
        queue: impl Into<String>,
        policy: RetryPolicy,
        span: Span,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Connecting);
        Self {
            connector,
            queue: queue.into(),
            policy,
            failure_pause: policy.delay,
            state,
            span,
        }
    }

    /// Pause after a failed delivery before asking for the next one, so a
    /// message that can never be processed does not spin the worker.
    /// Defaults to the retry delay.
    pub fn with_failure_pause(mut self, pause: Duration) -> Self {
        self.failure_pause = pause;
        self
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        debug!(?state, "Consumer state changed");
        self.state.send_replace(state);
    }

    /// Runs until `cancel` fires (returns `Ok`) or a fatal error occurs.
    pub async fn run<P: Processor>(
        &mut self,
        processor: &mut P,
        cancel: CancellationToken,
    ) -> RelayResult<()> {
        let span = self.span.clone();
        let result = self.run_inner(processor, &cancel).instrument(span).await;
        self.set_state(ConsumerState::Terminated);
        result
    }

    async fn run_inner<P: Processor>(
        &self,
        processor: &mut P,
        cancel: &CancellationToken,
    ) -> RelayResult<()> {
        loop {
            self.set_state(ConsumerState::Connecting);
            let connector = &self.connector;
            let connection =
                match supervisor::with_retry(|| connector.connect(), self.policy, cancel).await? {
                    Some(connection) => connection,
                    None => {
                        info!("Worker stopped before connecting");
                        return Ok(());
                    }
                };
            info!("Worker successfully connected to broker");

            match self.serve(connection, processor, cancel).await? {
                SessionEnd::Cancelled => {
                    info!("Worker stopped by shutdown signal");
                    return Ok(());
                }
                SessionEnd::ConnectionLost(e) => {
                    warn!(error = %e, "Lost broker connection, reconnecting");
                    if !self.pause(self.policy.delay, cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One subscribed session on one connection.
    async fn serve<P: Processor>(
        &self,
        mut connection: C::Connection,
        processor: &mut P,
        cancel: &CancellationToken,
    ) -> RelayResult<SessionEnd> {
        let end = match self.subscribe(&mut connection).await {
            Ok(()) => self.consume(&mut connection, processor, cancel).await,
            Err(e) if e.kind() == ErrorKind::QueueConflict => Err(e),
            Err(e) => Ok(SessionEnd::ConnectionLost(e)),
        };

        if let Err(e) = connection.close().await {
            debug!(error = %e, "Error while closing broker connection");
        }
        end
    }

    async fn subscribe(&self, connection: &mut C::Connection) -> RelayResult<()> {
        connection.declare_queue(&self.queue, true).await?;
        connection.set_prefetch(PREFETCH).await?;
        connection.consume(&self.queue).await?;
        self.set_state(ConsumerState::Subscribed);
        info!("Waiting for messages");
        Ok(())
    }

    async fn consume<P: Processor>(
        &self,
        connection: &mut C::Connection,
        processor: &mut P,
        cancel: &CancellationToken,
    ) -> RelayResult<SessionEnd> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                next = connection.next_delivery() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    return Ok(SessionEnd::ConnectionLost(RelayError::Connection(
                        "broker ended the subscription".to_string(),
                    )));
                }
                Err(e) => return Ok(SessionEnd::ConnectionLost(e)),
            };

            self.set_state(ConsumerState::Processing);
            let handled = self.handle(connection, processor, &delivery).await;
            self.set_state(ConsumerState::Subscribed);

            match handled {
                Ok(true) => {}
                Ok(false) => {
                    if !self.pause(self.failure_pause, cancel).await {
                        return Ok(SessionEnd::Cancelled);
                    }
                }
                Err(e) => return Ok(SessionEnd::ConnectionLost(e)),
            }
        }
    }

    /// Processes one delivery and settles it with the broker. Returns whether
    /// processing succeeded; an `Err` is a broker failure while settling.
    async fn handle<P: Processor>(
        &self,
        connection: &mut C::Connection,
        processor: &mut P,
        delivery: &Delivery,
    ) -> RelayResult<bool> {
        if delivery.redelivered {
            info!(tag = delivery.tag, "Processing redelivered message");
        }

        match processor.process(&delivery.body).await {
            Ok(()) => {
                connection.ack(delivery.tag).await?;
                debug!(tag = delivery.tag, "Message acknowledged");
                Ok(true)
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::Decode => error!(
                        tag = delivery.tag,
                        error = %e,
                        body = %String::from_utf8_lossy(&delivery.body),
                        "Malformed message, leaving it for redelivery"
                    ),
                    ErrorKind::Io => error!(
                        tag = delivery.tag,
                        error = %e,
                        "Failed to persist record, leaving message for redelivery"
                    ),
                    _ => error!(
                        tag = delivery.tag,
                        error = %e,
                        "Error processing message, leaving it for redelivery"
                    ),
                }
                connection.reject(delivery.tag, true).await?;
                Ok(false)
            }
        }
    }

    /// Waits `duration` unless cancelled first. Returns `false` on cancel.
    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if duration.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
