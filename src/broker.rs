// src/broker.rs
//
// Caller-facing facade. Owns the supervisor and wires the consumer and the
// publisher to it; no process-wide state.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::rabbitmq::amqp_client::AmqpTransport;
use crate::rabbitmq::batch_processor::InboundHandler;
use crate::rabbitmq::channel_manager::{ChannelConfig, ChannelManager};
use crate::rabbitmq::connection::{ConnectionState, ConnectionSupervisor};
use crate::rabbitmq::consumer::MessageConsumer;
use crate::rabbitmq::errors::Result;
use crate::rabbitmq::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::rabbitmq::publisher::{PublishOutcome, QueueStatus, RetryPublisher};
use crate::message::OutboundKind;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    pub connection: ConnectionState,
    pub queue: QueueStatus,
    pub metrics: MetricsSnapshot,
}

pub struct ChatBroker {
    config: BrokerConfig,
    supervisor: ConnectionSupervisor,
    consumer: Arc<MessageConsumer>,
    publisher: Arc<RetryPublisher>,
    metrics: Arc<MetricsRegistry>,
}

impl ChatBroker {
    pub fn new(config: BrokerConfig, transport: Arc<dyn AmqpTransport>) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let supervisor = ConnectionSupervisor::new(
            transport,
            config.connection.clone(),
            config.topology.clone(),
            config.reconnect.clone(),
            metrics.clone(),
        );
        let consumer = MessageConsumer::new(supervisor.clone(), config.batching.clone(), metrics.clone());
        let publisher = RetryPublisher::new(supervisor.clone(), config.retry.clone(), metrics.clone());

        Self {
            config,
            supervisor,
            consumer,
            publisher,
            metrics,
        }
    }

    /// Broker backed by a real RabbitMQ connection.
    pub fn with_lapin(config: BrokerConfig) -> Self {
        let transport = ChannelManager::new(ChannelConfig::from_connection(&config.connection));
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Connects once; fails with `ConnectionError` if the broker is unreachable.
    pub async fn connect(&self) -> Result<()> {
        self.supervisor.connect().await
    }

    /// Connects, falling back to background reconnection when the broker
    /// is not reachable yet. Never fails on an outage.
    pub async fn start(&self) {
        if let Err(e) = self.supervisor.connect().await {
            warn!(error = %e, "Initial connect failed, retrying in the background");
            self.supervisor.schedule_reconnect();
        }
    }

    /// Registers the handler for released batches and starts consuming.
    pub async fn on_inbound<H>(&self, handler: H) -> Result<()>
    where
        H: InboundHandler + 'static,
    {
        self.consumer.start(Arc::new(handler)).await
    }

    pub async fn publish(&self, kind: OutboundKind, payload: Value) -> PublishOutcome {
        self.publisher.publish(kind, payload).await
    }

    pub async fn publish_json<T: Serialize + Sync>(&self, kind: OutboundKind, payload: &T) -> Result<PublishOutcome> {
        self.publisher.publish_json(kind, payload).await
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.publisher.queue_status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            connection: self.connection_state(),
            queue: self.queue_status(),
            metrics: self.metrics(),
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Handle for publishing from inside an inbound handler.
    pub fn publisher(&self) -> Arc<RetryPublisher> {
        self.publisher.clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down chat broker");
        self.supervisor.shutdown().await
    }
}
