//! Event Bus Adapter: a reusable connection+channel factory over AMQP,
//! hiding broker specifics (fanout exchanges, durable queues, reply-to/
//! correlation-id RPC) from the rest of the fabric.
//!
//! Production code depends on the `Bus`/`Consumer` traits rather than the
//! concrete `EventBus`, so a fake in-memory transport can stand in for a
//! live broker in tests (see `tests/integration_tests.rs`).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{error, info, warn};

use crate::error::{FabricError, FabricResult};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// A single inbound message, backend-agnostic. `ack`/`nack_requeue` are
/// no-ops on a backend with no redelivery semantics (the in-memory fake).
pub struct Delivery {
    pub data: Vec<u8>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    lapin_delivery: Option<lapin::message::Delivery>,
}

impl Delivery {
    /// Builds a delivery with no backend redelivery handle, for transports
    /// (the in-memory fake) where ack/nack have nothing to signal.
    pub fn without_backend(data: Vec<u8>, reply_to: Option<String>, correlation_id: Option<String>) -> Self {
        Self { data, reply_to, correlation_id, lapin_delivery: None }
    }

    pub async fn ack(&self) {
        if let Some(d) = &self.lapin_delivery {
            if let Err(e) = d.ack(BasicAckOptions::default()).await {
                error!("bus: ack failed: {e}");
            }
        }
    }

    pub async fn nack_requeue(&self) {
        if let Some(d) = &self.lapin_delivery {
            if let Err(e) = d
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                error!("bus: nack failed: {e}");
            }
        }
    }
}

#[async_trait]
pub trait Consumer: Send {
    async fn recv(&mut self) -> Option<Delivery>;
}

/// Transport abstraction every subsystem (replication, snapshot, detection
/// engine, controller) is written against, so it can run over a live broker
/// (`EventBus`) or an in-memory fake with no code changes.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn declare_fanout(&self, name: &str, durable: bool) -> FabricResult<()>;
    /// Declares a queue and returns its (possibly server-generated) name.
    async fn declare_queue(&self, name: &str, durable: bool, exclusive: bool) -> FabricResult<String>;
    async fn bind_queue(&self, queue: &str, exchange: &str) -> FabricResult<()>;
    async fn publish_to_exchange(
        &self,
        exchange: &str,
        body: &[u8],
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> FabricResult<()>;
    async fn publish_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> FabricResult<()>;
    async fn consume(&self, queue: &str, consumer_tag: &str) -> FabricResult<Box<dyn Consumer>>;
}

pub struct EventBus {
    connection: Connection,
    channel: Channel,
}

impl EventBus {
    /// Connects to the broker, retrying with a fixed back-off forever. The
    /// broker is assumed reachable eventually; callers that need a bounded
    /// startup should wrap this in a timeout.
    pub async fn connect(broker_host: &str) -> Self {
        let uri = format!("amqp://{broker_host}/%2f");
        loop {
            match Connection::connect(&uri, ConnectionProperties::default()).await {
                Ok(connection) => match connection.create_channel().await {
                    Ok(channel) => {
                        info!("bus: connected to {broker_host}");
                        return Self { connection, channel };
                    }
                    Err(e) => warn!("bus: failed to open channel: {e}"),
                },
                Err(e) => warn!("bus: failed to connect to {broker_host}: {e}"),
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl Bus for EventBus {
    async fn declare_fanout(&self, name: &str, durable: bool) -> FabricResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| FabricError::Other(Box::new(e)))
    }

    async fn declare_queue(&self, name: &str, durable: bool, exclusive: bool) -> FabricResult<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    exclusive,
                    auto_delete: exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| FabricError::Other(Box::new(e)))?;
        Ok(queue.name().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> FabricResult<()> {
        self.channel
            .queue_bind(queue, exchange, "", QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| FabricError::Other(Box::new(e)))
    }

    async fn publish_to_exchange(
        &self,
        exchange: &str,
        body: &[u8],
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> FabricResult<()> {
        let properties = build_properties(reply_to, correlation_id);
        self.channel
            .basic_publish(exchange, "", BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| FabricError::Other(Box::new(e)))?
            .await
            .map_err(|e| FabricError::Other(Box::new(e)))?;
        Ok(())
    }

    async fn publish_to_queue(
        &self,
        queue: &str,
        body: &[u8],
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> FabricResult<()> {
        let properties = build_properties(reply_to, correlation_id);
        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| FabricError::Other(Box::new(e)))?
            .await
            .map_err(|e| FabricError::Other(Box::new(e)))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> FabricResult<Box<dyn Consumer>> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| FabricError::Other(Box::new(e)))?;
        Ok(Box::new(LapinConsumer(consumer)))
    }
}

fn build_properties(reply_to: Option<&str>, correlation_id: Option<&str>) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(rt) = reply_to {
        properties = properties.with_reply_to(rt.to_string().into());
    }
    if let Some(cid) = correlation_id {
        properties = properties.with_correlation_id(cid.to_string().into());
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_properties_carries_reply_to_and_correlation_id() {
        let props = build_properties(Some("reply-queue"), Some("corr-1"));
        assert_eq!(props.reply_to().as_ref().map(|s| s.to_string()), Some("reply-queue".to_string()));
        assert_eq!(props.correlation_id().as_ref().map(|s| s.to_string()), Some("corr-1".to_string()));
    }

    #[test]
    fn build_properties_omits_absent_fields() {
        let props = build_properties(None, None);
        assert!(props.reply_to().is_none());
        assert!(props.correlation_id().is_none());
    }

    #[tokio::test]
    async fn delivery_without_backend_ack_is_a_noop() {
        let delivery = Delivery::without_backend(b"payload".to_vec(), None, None);
        delivery.ack().await;
        delivery.nack_requeue().await;
        assert_eq!(delivery.data, b"payload");
    }
}

struct LapinConsumer(lapin::Consumer);

#[async_trait]
impl Consumer for LapinConsumer {
    async fn recv(&mut self) -> Option<Delivery> {
        match self.0.next().await {
            Some(Ok(delivery)) => {
                let reply_to = delivery.properties.reply_to().as_ref().map(|s| s.to_string());
                let correlation_id = delivery.properties.correlation_id().as_ref().map(|s| s.to_string());
                let data = delivery.data.clone();
                Some(Delivery {
                    data,
                    reply_to,
                    correlation_id,
                    lapin_delivery: Some(delivery),
                })
            }
            Some(Err(e)) => {
                error!("bus: consumer error: {e}");
                None
            }
            None => None,
        }
    }
}
