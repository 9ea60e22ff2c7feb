//! In-memory broker double.
//!
//! Behaves like a single-queue broker behind `AmqpTransport`: deliveries are
//! scripted with `deliver`, publishes and ack/nack decisions are recorded,
//! and outages are simulated with `set_reachable` / `drop_connection`. The
//! whole resilience layer runs against it without a RabbitMQ instance.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use super::amqp_client::{
    AmqpTransport, DeliveryAcker, DeliveryHandle, DeliveryStream, EventSink, OutboundMessage,
    RawDelivery,
};
use super::connection::lock;
use super::errors::{BrokerError, Result};
use crate::config::TopologyConfig;
use crate::message::OutboundKind;

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack(u64),
    Nack { tag: u64, requeue: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRecord {
    pub exchange: String,
    pub routing_key: String,
    pub kind: OutboundKind,
    pub attempt: u32,
    pub payload: Vec<u8>,
}

impl PublishedRecord {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

struct MemoryState {
    reachable: bool,
    open: bool,
    sink: Option<EventSink>,
    consumer: Option<mpsc::UnboundedSender<Result<RawDelivery>>>,
    publish_failures: u32,
    publish_attempts: usize,
    published: Vec<PublishedRecord>,
    next_tag: u64,
    opens: usize,
    closes: usize,
    consumes: usize,
    prefetch: Option<u16>,
}

#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    settlements: Arc<Mutex<Vec<Settlement>>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                reachable: true,
                open: false,
                sink: None,
                consumer: None,
                publish_failures: 0,
                publish_attempts: 0,
                published: Vec::new(),
                next_tag: 0,
                opens: 0,
                closes: 0,
                consumes: 0,
                prefetch: None,
            })),
            settlements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Controls whether the next `open()` succeeds.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    /// Makes the next `n` publishes fail with a `PublishError`.
    pub fn fail_next_publishes(&self, n: u32) {
        lock(&self.state).publish_failures = n;
    }

    /// Simulates the broker dropping the connection: the consumer stream
    /// ends and the supervisor is told through the event sink.
    pub fn drop_connection(&self) {
        let sink = {
            let mut state = lock(&self.state);
            state.open = false;
            state.consumer = None;
            state.sink.take()
        };
        if let Some(sink) = sink {
            sink.connection_lost("connection reset by peer");
        }
    }

    /// Builds a delivery without sending it anywhere.
    pub fn raw_delivery(&self, data: impl Into<Vec<u8>>, redelivered: bool) -> RawDelivery {
        let tag = {
            let mut state = lock(&self.state);
            state.next_tag += 1;
            state.next_tag
        };
        RawDelivery {
            data: data.into(),
            redelivered,
            handle: DeliveryHandle::new(
                tag,
                Arc::new(MemoryAcker {
                    tag,
                    settlements: self.settlements.clone(),
                }),
            ),
        }
    }

    /// Pushes a delivery to the active consumer. Returns its tag, or `None`
    /// when nobody is consuming.
    pub fn deliver(&self, data: impl Into<Vec<u8>>, redelivered: bool) -> Option<u64> {
        let raw = self.raw_delivery(data, redelivered);
        let tag = raw.delivery_tag();
        let state = lock(&self.state);
        let consumer = state.consumer.as_ref()?;
        consumer.send(Ok(raw)).ok()?;
        Some(tag)
    }

    pub fn published(&self) -> Vec<PublishedRecord> {
        lock(&self.state).published.clone()
    }

    /// Every publish call, including the failed ones.
    pub fn publish_attempts(&self) -> usize {
        lock(&self.state).publish_attempts
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        lock(&self.settlements).clone()
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    /// Number of `consume` calls that opened a consumer.
    pub fn consumes(&self) -> usize {
        lock(&self.state).consumes
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    pub fn is_consuming(&self) -> bool {
        lock(&self.state).consumer.is_some()
    }

    pub fn prefetch(&self) -> Option<u16> {
        lock(&self.state).prefetch
    }
}

#[async_trait]
impl AmqpTransport for MemoryTransport {
    async fn open(&self, _topology: &TopologyConfig, events: EventSink) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.reachable {
            return Err(BrokerError::ConnectionError("connection refused".to_string()));
        }
        state.open = true;
        state.opens += 1;
        state.sink = Some(events);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.open {
            state.closes += 1;
        }
        state.open = false;
        state.consumer = None;
        state.sink = None;
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage<'_>) -> Result<()> {
        let mut state = lock(&self.state);
        state.publish_attempts += 1;
        if !state.open {
            return Err(BrokerError::ChannelError("channel closed".to_string()));
        }
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(BrokerError::PublishError("broker nacked publish".to_string()));
        }
        state.published.push(PublishedRecord {
            exchange: message.exchange.to_string(),
            routing_key: message.routing_key.to_string(),
            kind: message.kind,
            attempt: message.attempt,
            payload: message.payload.to_vec(),
        });
        Ok(())
    }

    async fn consume(&self, _topology: &TopologyConfig, prefetch: u16) -> Result<DeliveryStream> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(BrokerError::ChannelError("channel closed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.consumer = Some(tx);
        state.consumes += 1;
        state.prefetch = Some(prefetch);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

struct MemoryAcker {
    tag: u64,
    settlements: Arc<Mutex<Vec<Settlement>>>,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        lock(&self.settlements).push(Settlement::Ack(self.tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        lock(&self.settlements).push(Settlement::Nack {
            tag: self.tag,
            requeue,
        });
        Ok(())
    }
}
