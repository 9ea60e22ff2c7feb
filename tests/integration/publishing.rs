use std::time::Duration;

use chat_broker::{OutboundKind, PublishOutcome, QueueStatus};
use serde::Serialize;
use serde_json::json;
use tokio::time::sleep;

use crate::{broker_with, test_config};

#[tokio::test(start_paused = true)]
async fn publish_during_outage_is_delivered_after_reconnect() {
    let (transport, broker) = broker_with(test_config());
    transport.set_reachable(false);
    broker.start().await;

    let outcome = broker.publish(OutboundKind::Reply, json!({ "text": "tiket dibuat" })).await;
    assert_eq!(outcome, PublishOutcome::Queued);
    assert_eq!(broker.queue_status().size, 1);
    assert!(transport.published().is_empty());

    transport.set_reachable(true);
    sleep(Duration::from_secs(2)).await;

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "chat.outbound.reply");
    assert_eq!(published[0].json(), json!({ "text": "tiket dibuat" }));
    assert_eq!(broker.queue_status(), QueueStatus { size: 0, oldest_pending_age_ms: None });
}

#[tokio::test(start_paused = true)]
async fn full_retry_queue_sheds_the_oldest() {
    let (transport, broker) = broker_with(test_config());
    for text in ["A", "B", "C"] {
        broker.publish(OutboundKind::Status, json!({ "text": text })).await;
    }
    assert_eq!(broker.queue_status().size, 2);
    assert_eq!(broker.metrics().envelopes_evicted, 1);

    broker.connect().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let texts: Vec<String> = transport
        .published()
        .iter()
        .map(|record| record.json()["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn permanently_failing_publish_is_dropped() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();
    transport.fail_next_publishes(100);

    broker.publish(OutboundKind::Error, json!({ "text": "x" })).await;
    sleep(Duration::from_secs(3)).await;

    assert_eq!(transport.publish_attempts(), 3);
    assert_eq!(broker.queue_status().size, 0);
    assert_eq!(broker.metrics().envelopes_dropped, 1);
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TicketReply {
    partition_key: String,
    ticket_id: u32,
}

#[tokio::test(start_paused = true)]
async fn typed_payloads_are_serialized() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();

    let reply = TicketReply { partition_key: "U".to_string(), ticket_id: 42 };
    let outcome = broker.publish_json(OutboundKind::Reply, &reply).await.unwrap();

    assert_eq!(outcome, PublishOutcome::Sent);
    assert_eq!(transport.published()[0].json(), json!({ "partitionKey": "U", "ticketId": 42 }));
}
