// src/rabbitmq/channel_manager.rs
//
// lapin-backed `AmqpTransport`: one connection, one confirm-mode channel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{
    AmqpTransport, DeliveryAcker, DeliveryHandle, DeliveryStream, EventSink, OutboundMessage,
    RawDelivery,
};
use super::errors::{BrokerError, Result};
use crate::config::{ConnectionConfig, TopologyConfig};

/// Configuration options for the broker channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Connection URI, heartbeat included
    pub uri: String,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging
    pub id: String,
}

impl ChannelConfig {
    pub fn from_connection(connection: &ConnectionConfig) -> Self {
        Self {
            uri: connection.effective_uri(),
            confirm_mode: connection.confirm_mode,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

struct Link {
    connection: Connection,
    channel: Channel,
}

pub struct ChannelManager {
    config: ChannelConfig,
    link: Mutex<Option<Link>>,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> Self {
        debug!(channel_id = %config.id, confirm = %config.confirm_mode, "Creating channel manager");
        Self {
            config,
            link: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<Channel> {
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) if link.channel.status().connected() => Ok(link.channel.clone()),
            _ => Err(BrokerError::ChannelError("channel is not open".to_string())),
        }
    }
}

pub fn exchange_kind(name: &str) -> ExchangeKind {
    match name.to_ascii_lowercase().as_str() {
        "topic" => ExchangeKind::Topic,
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        _ => ExchangeKind::Custom(name.to_string()),
    }
}

pub fn consumer_tag(queue: &str) -> String {
    format!("{}-{}", queue, &Uuid::new_v4().simple().to_string()[..8])
}

#[async_trait]
impl AmqpTransport for ChannelManager {
    async fn open(&self, topology: &TopologyConfig, events: EventSink) -> Result<()> {
        info!(
            channel_id = %self.config.id,
            generation = events.generation(),
            "Connecting to RabbitMQ"
        );
        let connection = Connection::connect(&self.config.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        let sink = events.clone();
        connection.on_error(move |err| {
            error!(error = %err, "Connection error");
            sink.connection_lost(err.to_string());
        });

        let channel = connection.create_channel().await?;
        let sink = events;
        channel.on_error(move |err| {
            error!(error = %err, "Channel error");
            sink.connection_lost(err.to_string());
        });

        if self.config.confirm_mode {
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
        }

        channel
            .exchange_declare(
                &topology.exchange,
                exchange_kind(&topology.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(exchange = %topology.exchange, kind = %topology.exchange_type, "Declared exchange");

        *self.link.lock().await = Some(Link { connection, channel });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };

        if link.channel.status().connected() {
            if let Err(e) = link.channel.close(200, "Bye").await {
                warn!(channel_id = %self.config.id, error = %e, "Failed to close channel");
            }
        }
        if link.connection.status().connected() {
            link.connection.close(200, "Bye").await?;
        }
        debug!(channel_id = %self.config.id, "Closed channel and connection");
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage<'_>) -> Result<()> {
        let channel = self.channel().await?;

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-kind"),
            AMQPValue::LongString(LongString::from(message.kind.as_str())),
        );
        headers.insert(ShortString::from("x-attempt"), AMQPValue::LongUInt(message.attempt));

        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(message.message_id.to_string()))
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(2)
            .with_timestamp(Utc::now().timestamp() as u64)
            .with_headers(headers);

        let confirm = channel
            .basic_publish(
                message.exchange,
                message.routing_key,
                BasicPublishOptions::default(),
                message.payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::PublishError(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::PublishError(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(BrokerError::PublishError("broker nacked publish".to_string()));
        }
        Ok(())
    }

    async fn consume(&self, topology: &TopologyConfig, prefetch: u16) -> Result<DeliveryStream> {
        let channel = self.channel().await?;

        channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel.basic_qos(prefetch, BasicQosOptions::default()).await?;

        let tag = consumer_tag(&topology.queue);
        let consumer = channel
            .basic_consume(
                &topology.queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConsumeError(e.to_string()))?;
        info!(queue = %topology.queue, consumer_tag = %tag, "Started consumer");

        Ok(consumer
            .map(|item| match item {
                Ok(delivery) => Ok(RawDelivery {
                    handle: DeliveryHandle::new(
                        delivery.delivery_tag,
                        Arc::new(LapinAcker(delivery.acker)),
                    ),
                    data: delivery.data,
                    redelivered: delivery.redelivered,
                }),
                Err(e) => Err(BrokerError::ConsumeError(e.to_string())),
            })
            .boxed())
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))
    }
}
