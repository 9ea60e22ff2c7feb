use std::time::Duration;

use chat_broker::rabbitmq::memory::Settlement;
use chat_broker::ConnectionState;
use tokio::time::sleep;

use crate::{broker_with, chat, record_batches, test_config};

#[tokio::test(start_paused = true)]
async fn consumer_comes_back_after_broker_restart() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();
    let seen = record_batches(&broker, false).await;

    transport.drop_connection();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(broker.connection_state(), ConnectionState::Reconnecting);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.connection_state(), ConnectionState::Connected);
    assert!(transport.is_consuming());
    assert_eq!(transport.opens(), 2);

    let tag = transport.deliver(chat("U", "m1", "halo lagi"), false).unwrap();
    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(transport.settlements(), vec![Settlement::Ack(tag)]);
    assert_eq!(broker.metrics().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn buffered_events_survive_an_outage() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();
    let seen = record_batches(&broker, false).await;

    transport.deliver(chat("U", "m1", "sebelum putus"), false).unwrap();
    sleep(Duration::from_millis(10)).await;
    transport.set_reachable(false);
    transport.drop_connection();

    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_ne!(broker.connection_state(), ConnectionState::Connected);

    transport.set_reachable(true);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(broker.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn status_is_serializable() {
    let (_transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();

    let status = serde_json::to_value(broker.status()).unwrap();
    assert_eq!(status["connection"], "Connected");
    assert_eq!(status["queue"]["size"], 0);
    assert_eq!(status["metrics"]["acked"], 0);
}
