//! RabbitMQ backend
//!
//! Built on `lapin`. Every connection carries the configured heartbeat so a
//! dead peer is noticed at the transport level, and every broker operation
//! that can stall on a blocked connection (publish and its confirm, ack,
//! reject, and the declare/qos/consume/close handshakes) is bounded by the
//! blocked-connection timeout. Hitting the timeout is reported as a
//! connection failure; a close that times out drops the connection without
//! waiting for the broker's CloseOk.
//!
//! Dropping an `AmqpConnection` that was not closed explicitly schedules a
//! close on the current runtime, so the connection is released on every
//! exit path.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BrokerConnection, Connector, Delivery};
use crate::config::RabbitSettings;
use crate::utils::{RelayError, RelayResult};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens connections to RabbitMQ using the configured host and credentials.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    settings: RabbitSettings,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(settings: RabbitSettings, connection_name: impl Into<String>) -> Self {
        Self {
            settings,
            connection_name: connection_name.into(),
        }
    }

    fn uri(&self) -> AMQPUri {
        let timeout_ms = self.settings.blocked_timeout().as_millis();
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.settings.username.clone(),
                    password: self.settings.password.clone(),
                },
                host: self.settings.host.clone(),
                port: self.settings.port,
            },
            vhost: self.settings.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.settings.heartbeat_secs),
                connection_timeout: Some(u64::try_from(timeout_ms).unwrap_or(u64::MAX)),
                ..Default::default()
            },
        }
    }

    /// `amqp://user@host:port/vhost`, without the password.
    pub fn endpoint(&self) -> String {
        let vhost = self.settings.vhost.trim_start_matches('/');
        format!(
            "amqp://{}@{}:{}/{}",
            self.settings.username, self.settings.host, self.settings.port, vhost
        )
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn connect(&self) -> RelayResult<AmqpConnection> {
        debug!(endpoint = %self.endpoint(), "Connecting to broker");

        // Heartbeats and socket IO run on the caller's tokio runtime.
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio)
            .with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect_uri(self.uri(), properties)
            .await
            .map_err(lost)?;
        let channel = connection.create_channel().await.map_err(lost)?;

        Ok(AmqpConnection {
            connection: Some(connection),
            channel,
            consumer: None,
            confirms_enabled: false,
            blocked_timeout: self.settings.blocked_timeout(),
        })
    }
}

/// One connection with a single channel.
pub struct AmqpConnection {
    connection: Option<Connection>,
    channel: Channel,
    consumer: Option<Consumer>,
    confirms_enabled: bool,
    blocked_timeout: Duration,
}

fn lost(err: lapin::Error) -> RelayError {
    RelayError::Connection(err.to_string())
}

/// Runs a broker operation under the blocked-connection timeout.
pub(super) async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> RelayResult<T>
where
    F: Future<Output = RelayResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Connection(format!(
            "{operation} did not complete within {limit:?}; connection blocked or unresponsive"
        ))),
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_queue(&mut self, queue: &str, durable: bool) -> RelayResult<()> {
        let options = QueueDeclareOptions {
            durable,
            ..Default::default()
        };
        let channel = self.channel.clone();
        bounded(self.blocked_timeout, "queue declare", async move {
            match channel
                .queue_declare(queue, options, FieldTable::default())
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if is_precondition_failed(&e) => Err(RelayError::QueueConflict {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                }),
                Err(e) => Err(lost(e)),
            }
        })
        .await
    }

    async fn publish(&mut self, queue: &str, body: &[u8], persistent: bool) -> RelayResult<()> {
        if !self.confirms_enabled {
            let channel = self.channel.clone();
            bounded(self.blocked_timeout, "confirm select", async move {
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(lost)
            })
            .await?;
            self.confirms_enabled = true;
        }

        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        let channel = self.channel.clone();
        let confirmation = bounded(self.blocked_timeout, "publish", async move {
            channel
                .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
                .await
                .map_err(lost)?
                .await
                .map_err(lost)
        })
        .await?;

        match confirmation {
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(RelayError::Publish {
                queue: queue.to_string(),
                reason: "broker refused the message (negative confirm)".to_string(),
            }),
        }
    }

    async fn set_prefetch(&mut self, count: u16) -> RelayResult<()> {
        let channel = self.channel.clone();
        bounded(self.blocked_timeout, "qos", async move {
            channel
                .basic_qos(count, BasicQosOptions::default())
                .await
                .map_err(lost)
        })
        .await
    }

    async fn consume(&mut self, queue: &str) -> RelayResult<()> {
        let tag = format!("msgrelay-{}", Uuid::new_v4());
        let channel = self.channel.clone();
        let consumer = bounded(self.blocked_timeout, "consume", async move {
            channel
                .basic_consume(
                    queue,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(lost)
        })
        .await?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&mut self) -> RelayResult<Option<Delivery>> {
        let consumer = self
            .consumer
            .as_mut()
            .ok_or_else(|| RelayError::Connection("not subscribed to any queue".to_string()))?;

        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                tag: delivery.delivery_tag,
                body: delivery.data,
                redelivered: delivery.redelivered,
            })),
            Some(Err(e)) => Err(lost(e)),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, tag: u64) -> RelayResult<()> {
        let channel = self.channel.clone();
        bounded(self.blocked_timeout, "ack", async move {
            channel
                .basic_ack(tag, BasicAckOptions::default())
                .await
                .map_err(lost)
        })
        .await
    }

    async fn reject(&mut self, tag: u64, requeue: bool) -> RelayResult<()> {
        let channel = self.channel.clone();
        bounded(self.blocked_timeout, "reject", async move {
            channel
                .basic_reject(tag, BasicRejectOptions { requeue })
                .await
                .map_err(lost)
        })
        .await
    }

    /// Sends Connection.Close and waits for CloseOk, at most the blocked
    /// timeout. On timeout the connection is dropped without the handshake.
    async fn close(&mut self) -> RelayResult<()> {
        self.consumer = None;
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        bounded(self.blocked_timeout, "close", async move {
            connection.close(REPLY_SUCCESS, "OK").await.map_err(lost)
        })
        .await
    }
}

impl Drop for AmqpConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let limit = self.blocked_timeout;
                handle.spawn(async move {
                    let closing = async move {
                        connection.close(REPLY_SUCCESS, "OK").await.map_err(lost)
                    };
                    if let Err(e) = bounded(limit, "close", closing).await {
                        debug!("Close on drop failed: {e}");
                    }
                });
            }
            Err(_) => warn!("Broker connection dropped outside a runtime; not closed cleanly"),
        }
    }
}
