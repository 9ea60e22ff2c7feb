use std::time::Duration;

use chat_broker::{BrokerError, ConnectionState};
use tokio::time::sleep;

use crate::{broker_with, chat, record_batches, test_config};

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_open_batches_and_closes() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();
    let seen = record_batches(&broker, false).await;

    transport.deliver(chat("U", "m1", "halo"), false).unwrap();
    sleep(Duration::from_millis(10)).await;

    broker.shutdown().await.unwrap();
    sleep(Duration::from_secs(5)).await;

    assert!(seen.lock().unwrap().is_empty());
    assert!(transport.settlements().is_empty());
    assert!(!transport.is_open());
    assert_eq!(broker.connection_state(), ConnectionState::Disconnected);
    assert_eq!(broker.metrics().batches_abandoned, 1);
}

#[tokio::test(start_paused = true)]
async fn no_reconnect_after_shutdown() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();
    broker.shutdown().await.unwrap();
    broker.shutdown().await.unwrap();

    transport.drop_connection();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.opens(), 1);
    assert!(matches!(broker.connect().await, Err(BrokerError::ShuttingDown)));
}
