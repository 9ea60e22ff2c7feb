// Integration tests drive the whole broker layer through the public API
// against the in-memory transport. The live_broker module needs RabbitMQ
// and is ignored by default.

mod batching;
mod config;
mod live_broker;
mod publishing;
mod reconnect;
mod shutdown;

use std::sync::{Arc, Mutex};

use chat_broker::config::{BatchConfig, BrokerConfig, ReconnectConfig, RetryConfig};
use chat_broker::rabbitmq::MemoryTransport;
use chat_broker::{ChatBroker, CombinedEvent};

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        batching: BatchConfig {
            max_wait_ms: 1_000,
            max_batch_size: 10,
            window_ms: 3_000,
            ..BatchConfig::default()
        },
        retry: RetryConfig {
            max_attempts: 3,
            retry_interval_ms: 500,
            max_queue_size: 2,
            batch_size: 10,
        },
        reconnect: ReconnectConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
            max_attempts: None,
        },
        ..BrokerConfig::default()
    }
}

pub fn broker_with(config: BrokerConfig) -> (MemoryTransport, ChatBroker) {
    let transport = MemoryTransport::new();
    let broker = ChatBroker::new(config, Arc::new(transport.clone()));
    (transport, broker)
}

pub fn chat(key: &str, id: &str, payload: &str) -> String {
    serde_json::json!({
        "partitionKey": key,
        "messageId": id,
        "payload": payload,
        "receivedAt": "2024-05-01T08:00:00Z",
    })
    .to_string()
}

/// Registers a handler that records every batch and fails when `fail` is set.
pub async fn record_batches(broker: &ChatBroker, fail: bool) -> Arc<Mutex<Vec<CombinedEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    broker
        .on_inbound(move |event: CombinedEvent| {
            sink.lock().unwrap().push(event);
            async move {
                if fail {
                    anyhow::bail!("ticket service returned 503");
                }
                Ok(())
            }
        })
        .await
        .unwrap();
    seen
}
