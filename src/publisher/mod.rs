//! Publisher
//!
//! Hands validated messages to the broker. Every call opens its own
//! connection, declares the work queue as durable, publishes the JSON body
//! with persistent delivery mode and waits for the broker's confirm before
//! closing the connection again. Connections are never shared between
//! calls, so concurrent publishes are safe.
//!
//! A successful return means the broker has durably stored the message, not
//! that any consumer has seen it. Every failure is reported as
//! `RelayError::Publish` and is not retried here.

use tracing::{Instrument, Span, info, info_span, warn};

use crate::broker::{BrokerConnection, Connector, Message};
use crate::utils::RelayResult;

#[derive(Debug, Clone)]
pub struct Publisher<C> {
    connector: C,
    queue: String,
    span: Span,
}

impl<C: Connector> Publisher<C> {
    pub fn new(connector: C, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        let span = info_span!("publisher", queue = %queue);
        Self::with_span(connector, queue, span)
    }

    /// Uses `span` as the logging context for every publish.
    pub fn with_span(connector: C, queue: impl Into<String>, span: Span) -> Self {
        Self {
            connector,
            queue: queue.into(),
            span,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn publish(&self, message: &Message) -> RelayResult<()> {
        self.publish_to(&self.queue, message).await
    }

    /// Publishes to an explicit queue instead of the configured one.
    pub async fn publish_to(&self, queue: &str, message: &Message) -> RelayResult<()> {
        async {
            let body = message.encode().map_err(|e| e.into_publish(queue))?;

            let mut connection = self
                .connector
                .connect()
                .await
                .map_err(|e| e.into_publish(queue))?;

            let published = publish_on(&mut connection, queue, &body).await;

            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close broker connection after publish");
            }

            match published {
                Ok(()) => {
                    info!(priority = message.priority, bytes = body.len(), "Message published");
                    Ok(())
                }
                Err(e) => {
                    let err = e.into_publish(queue);
                    warn!(error = %err, "Publish failed");
                    Err(err)
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }
}

async fn publish_on<B: BrokerConnection>(
    connection: &mut B,
    queue: &str,
    body: &[u8],
) -> RelayResult<()> {
    connection.declare_queue(queue, true).await?;
    connection.publish(queue, body, true).await
}
