//! Message-broker resilience layer for the chat platform.
//!
//! Inbound chat events are consumed from a topic exchange, batched per
//! partition key and handed to a business handler; outbound replies, errors
//! and status updates are published with a bounded retry queue. Everything
//! survives broker restarts through `ConnectionSupervisor`.

pub mod broker;
pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use broker::{BrokerStatus, ChatBroker};
pub use config::BrokerConfig;
pub use message::{CombinedEvent, InboundEvent, OutboundKind};
pub use rabbitmq::{BrokerError, ConnectionState, PublishOutcome, QueueStatus, Result};
