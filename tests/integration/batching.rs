use std::time::Duration;

use chat_broker::rabbitmq::memory::Settlement;
use tokio::time::sleep;

use crate::{broker_with, chat, record_batches, test_config};

#[tokio::test(start_paused = true)]
async fn burst_from_one_user_becomes_one_numbered_message() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();
    let seen = record_batches(&broker, false).await;

    let mut tags = Vec::new();
    for (i, text) in ["halo", "saya budi", "mau lapor"].iter().enumerate() {
        tags.push(transport.deliver(chat("U", &format!("m{}", i), text), false).unwrap());
        sleep(Duration::from_millis(200)).await;
    }
    sleep(Duration::from_millis(1_000)).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload, "1. halo\n2. saya budi\n3. mau lapor");
    assert_eq!(seen[0].event_count, 3);

    let acks: Vec<Settlement> = tags.iter().map(|tag| Settlement::Ack(*tag)).collect();
    assert_eq!(transport.settlements(), acks);
    assert_eq!(broker.metrics().acked, 3);
    assert_eq!(broker.metrics().batches_released, 1);
}

#[tokio::test(start_paused = true)]
async fn users_are_never_merged_together() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();
    let seen = record_batches(&broker, false).await;

    transport.deliver(chat("U1", "a", "jalan rusak"), false).unwrap();
    transport.deliver(chat("U2", "b", "lampu mati"), false).unwrap();
    sleep(Duration::from_millis(1_100)).await;

    let mut keys: Vec<String> = seen.lock().unwrap().iter().map(|e| e.partition_key.clone()).collect();
    keys.sort();
    assert_eq!(keys, vec!["U1", "U2"]);
    assert_eq!(transport.settlements().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn poison_message_gets_exactly_one_retry() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();
    let seen = record_batches(&broker, true).await;

    let first = transport.deliver(chat("U", "m1", "boom"), false).unwrap();
    sleep(Duration::from_millis(1_100)).await;
    // the broker hands the requeued message back flagged as redelivered
    let second = transport.deliver(chat("U", "m1", "boom"), true).unwrap();
    sleep(Duration::from_millis(1_100)).await;

    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(
        transport.settlements(),
        vec![
            Settlement::Nack { tag: first, requeue: true },
            Settlement::Nack { tag: second, requeue: false },
        ]
    );
    let metrics = broker.metrics();
    assert_eq!(metrics.handler_failures, 2);
    assert_eq!(metrics.nacked_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn prefetch_bounds_inflight_deliveries() {
    let (transport, broker) = broker_with(test_config());
    broker.connect().await.unwrap();
    record_batches(&broker, false).await;
    assert_eq!(transport.prefetch(), Some(10));
}
