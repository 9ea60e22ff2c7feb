use std::time::Duration;

use chat_broker::config::BrokerConfig;
use chat_broker::{ChatBroker, CombinedEvent, ConnectionState, OutboundKind, PublishOutcome};
use serde_json::json;

fn live_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    if let Ok(uri) = std::env::var("AMQP_ADDR") {
        config.connection.uri = uri;
    }
    config.topology.queue = format!("chatbot.inbound.test-{}", uuid::Uuid::new_v4());
    config
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn connects_publishes_and_shuts_down() {
    let broker = ChatBroker::with_lapin(live_config());
    broker.connect().await.unwrap();
    assert_eq!(broker.connection_state(), ConnectionState::Connected);

    broker
        .on_inbound(|_event: CombinedEvent| async { Ok::<(), anyhow::Error>(()) })
        .await
        .unwrap();

    let outcome = broker.publish(OutboundKind::Status, json!({ "status": "ping" })).await;
    assert_eq!(outcome, PublishOutcome::Sent);

    tokio::time::sleep(Duration::from_millis(200)).await;
    broker.shutdown().await.unwrap();
    assert_eq!(broker.connection_state(), ConnectionState::Disconnected);
}
