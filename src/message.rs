use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::rabbitmq::amqp_client::{DeliveryHandle, RawDelivery};
use crate::rabbitmq::errors::{BrokerError, Result};

/// JSON body of an inbound chat event as it arrives on the queue.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    pub partition_key: String,
    pub message_id: String,
    pub payload: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Value>,
}

/// A parsed inbound event together with the delivery it came from.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub partition_key: String,
    pub payload: String,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub attachment: Option<Value>,
    pub delivery: DeliveryHandle,
    pub redelivered: bool,
}

impl InboundEvent {
    /// Parses a raw broker delivery. The delivery handle is moved into the
    /// event so the ack coordinator can settle it after the batch completes.
    pub fn from_delivery(raw: RawDelivery) -> Result<Self> {
        Self::parse(&raw)
    }

    /// Like `from_delivery`, leaving the raw body available to the caller.
    pub fn parse(raw: &RawDelivery) -> Result<Self> {
        let envelope: InboundEnvelope = serde_json::from_slice(&raw.data)
            .map_err(|e| BrokerError::DeserializationError(e.to_string()))?;

        if envelope.partition_key.trim().is_empty() {
            return Err(BrokerError::DeserializationError(
                "partitionKey must not be empty".to_string(),
            ));
        }

        Ok(Self {
            partition_key: envelope.partition_key,
            payload: envelope.payload,
            message_id: envelope.message_id,
            received_at: envelope.received_at,
            attachment: envelope.attachment,
            delivery: raw.handle.clone(),
            redelivered: raw.redelivered,
        })
    }
}

/// Best-effort `messageId` of a body that is not a valid envelope.
pub fn peek_message_id(data: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(data).ok()?;
    value.get("messageId")?.as_str().map(str::to_string)
}

/// What the caller's handler receives once a batch is released.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedEvent {
    pub batch_id: Uuid,
    pub partition_key: String,
    pub payload: String,
    pub message_ids: Vec<String>,
    pub first_received_at: DateTime<Utc>,
    pub attachment: Option<Value>,
    pub event_count: usize,
}

impl CombinedEvent {
    /// Merges the events of one partition key, in arrival order.
    /// Returns `None` for an empty slice.
    pub fn merge(batch_id: Uuid, events: &[InboundEvent], connective: &str) -> Option<Self> {
        let first = events.first()?;
        let parts: Vec<&str> = events.iter().map(|e| e.payload.as_str()).collect();

        Some(Self {
            batch_id,
            partition_key: first.partition_key.clone(),
            payload: merge_payloads(&parts, connective),
            message_ids: events.iter().map(|e| e.message_id.clone()).collect(),
            first_received_at: first.received_at,
            attachment: events.iter().find_map(|e| e.attachment.clone()),
            event_count: events.len(),
        })
    }
}

/// One part is passed through, two parts are joined with `connective`,
/// three or more are numbered one per line.
pub fn merge_payloads(parts: &[&str], connective: &str) -> String {
    match parts {
        [] => String::new(),
        [only] => (*only).to_string(),
        [first, second] => format!("{}{}{}", first, connective, second),
        _ => parts
            .iter()
            .enumerate()
            .map(|(i, part)| format!("{}. {}", i + 1, part))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
    Reply,
    Error,
    Status,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::Reply => "reply",
            OutboundKind::Error => "error",
            OutboundKind::Status => "status",
        }
    }
}

impl std::fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound publish that is waiting in the retry queue.
#[derive(Clone, Debug)]
pub struct OutboundEnvelope {
    pub id: Uuid,
    pub kind: OutboundKind,
    pub payload: Value,
    pub attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub(crate) queued_at: Instant,
}

impl OutboundEnvelope {
    pub fn new(kind: OutboundKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            attempts: 0,
            first_attempt_at: Utc::now(),
            last_attempt_at: None,
            queued_at: Instant::now(),
        }
    }

    /// Records one failed send.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt_at = Some(Utc::now());
    }

    pub fn age(&self) -> std::time::Duration {
        self.queued_at.elapsed()
    }
}
