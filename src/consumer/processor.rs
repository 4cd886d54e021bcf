use async_trait::async_trait;
use tracing::info;

use crate::broker::{DeliveryRecord, Message};
use crate::sink::LogSink;
use crate::utils::RelayResult;

/// Work applied to each delivery. Returning `Ok` is what allows the consumer
/// loop to acknowledge the message; any error leaves it for redelivery.
#[async_trait]
pub trait Processor: Send {
    async fn process(&mut self, body: &[u8]) -> RelayResult<()>;
}

/// Decodes the message, stamps it and appends it to the durable log.
#[derive(Debug)]
pub struct SinkProcessor {
    sink: LogSink,
}

impl SinkProcessor {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Processor for SinkProcessor {
    async fn process(&mut self, body: &[u8]) -> RelayResult<()> {
        let message = Message::decode(body)?;
        let record = DeliveryRecord::from_message(message);
        self.sink.append(&record).await?;
        info!(
            content = %record.content,
            priority = record.priority,
            timestamp = %record.timestamp,
            "Processed message"
        );
        Ok(())
    }
}
