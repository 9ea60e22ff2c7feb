// src/rabbitmq/mod.rs
// Broker resilience layer: connection supervision, inbound batching and
// acking, outbound publishing with retry.

pub mod amqp_client;
pub mod batch_processor;
pub mod channel_manager;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod memory;
pub mod metrics;
pub mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpTransport, DeliveryHandle, EventSink, TransportEvent};
pub use batch_processor::{BatchAccumulator, InboundHandler, ReleaseTrigger};
pub use channel_manager::{ChannelConfig, ChannelManager};
pub use connection::{ConnectionListener, ConnectionState, ConnectionSupervisor};
pub use consumer::{AckCoordinator, MessageConsumer};
pub use errors::{BrokerError, Result};
pub use memory::MemoryTransport;
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use publisher::{PublishOutcome, QueueStatus, RetryPublisher};
