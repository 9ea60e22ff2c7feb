// src/rabbitmq/amqp_client.rs
//
// The seam between the resilience layer and an AMQP client. Everything above
// this trait is broker-agnostic and can be driven by `MemoryTransport` in
// tests; `ChannelManager` is the lapin-backed implementation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::errors::Result;
use crate::config::TopologyConfig;
use crate::message::OutboundKind;

/// Reported by a transport adapter when something outside our control
/// happens to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionLost { generation: u64, reason: String },
}

/// Handed to the adapter on every `open()`. The generation lets the
/// supervisor ignore late events from a connection it already replaced.
#[derive(Clone, Debug)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection_lost(&self, reason: impl Into<String>) {
        // The receiver only goes away once the supervisor itself is dropped.
        let _ = self.tx.send(TransportEvent::ConnectionLost {
            generation: self.generation,
            reason: reason.into(),
        });
    }
}

#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

// Delivery tags restart on every channel; this id does not.
static NEXT_DELIVERY_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle used to settle one broker delivery.
#[derive(Clone)]
pub struct DeliveryHandle {
    id: u64,
    tag: u64,
    acker: Arc<dyn DeliveryAcker>,
}

impl DeliveryHandle {
    pub fn new(tag: u64, acker: Arc<dyn DeliveryAcker>) -> Self {
        Self {
            id: NEXT_DELIVERY_ID.fetch_add(1, Ordering::Relaxed),
            tag,
            acker,
        }
    }

    /// Process-unique id, stable across reconnects.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Broker delivery tag, unique only within one channel.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .finish()
    }
}

/// A delivery before its body has been parsed.
#[derive(Debug)]
pub struct RawDelivery {
    pub data: Vec<u8>,
    pub redelivered: bool,
    pub handle: DeliveryHandle,
}

impl RawDelivery {
    pub fn delivery_tag(&self) -> u64 {
        self.handle.tag()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Everything needed to put one outbound message on the wire.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub kind: OutboundKind,
    pub message_id: Uuid,
    pub attempt: u32,
    pub payload: &'a [u8],
}

#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// Opens a fresh connection and channel and asserts the exchange. The
    /// supervisor always calls `close()` before this. Unexpected closes of
    /// what was opened here must be reported through `events`.
    async fn open(&self, topology: &TopologyConfig, events: EventSink) -> Result<()>;

    /// Closes the channel, then the connection. A no-op when nothing is open.
    async fn close(&self) -> Result<()>;

    /// Persistent publish on the current channel.
    async fn publish(&self, message: OutboundMessage<'_>) -> Result<()>;

    /// Asserts queue and binding, applies `prefetch` and starts consuming.
    async fn consume(&self, topology: &TopologyConfig, prefetch: u16) -> Result<DeliveryStream>;
}
