// src/rabbitmq/consumer.rs
//
// Pulls deliveries off the inbound queue, feeds them to the batch
// accumulator and settles them once their batch has been handled.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use futures_lite::StreamExt;
use tokio::task::JoinHandle;
use tracing::field::display;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{DeliveryHandle, RawDelivery};
use super::batch_processor::{BatchAccumulator, BatchCompletion, InboundHandler, ReleasedBatch};
use super::connection::{lock, ConnectionListener, ConnectionSupervisor};
use super::errors::{BrokerError, Result};
use super::metrics::MetricsRegistry;
use crate::config::BatchConfig;
use crate::message::{peek_message_id, InboundEvent};

/// What a nacked delivery belongs to, for the log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct NackContext<'a> {
    pub batch_id: Option<Uuid>,
    pub partition_key: Option<&'a str>,
    pub message_id: Option<&'a str>,
}

impl<'a> NackContext<'a> {
    pub fn for_event(batch_id: Uuid, event: &'a InboundEvent) -> Self {
        Self {
            batch_id: Some(batch_id),
            partition_key: Some(event.partition_key.as_str()),
            message_id: Some(event.message_id.as_str()),
        }
    }
}

/// Keeps track of which deliveries belong to in-flight batches and settles
/// each of them exactly once.
pub struct AckCoordinator {
    inflight: Mutex<HashMap<String, HashSet<u64>>>,
    metrics: Arc<MetricsRegistry>,
}

impl AckCoordinator {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn track(&self, partition_key: &str, delivery: &DeliveryHandle) {
        lock(&self.inflight)
            .entry(partition_key.to_string())
            .or_default()
            .insert(delivery.id());
    }

    /// Returns false if the delivery was not tracked, i.e. it has already
    /// been settled.
    pub fn untrack(&self, partition_key: &str, delivery: &DeliveryHandle) -> bool {
        let mut inflight = lock(&self.inflight);
        let Some(ids) = inflight.get_mut(partition_key) else {
            return false;
        };
        let removed = ids.remove(&delivery.id());
        if ids.is_empty() {
            inflight.remove(partition_key);
        }
        removed
    }

    /// Deliveries buffered or being handled, across all keys.
    pub fn inflight_count(&self) -> usize {
        lock(&self.inflight).values().map(HashSet::len).sum()
    }

    /// Nacks a single delivery. Redelivered messages are dropped so a
    /// poison message gets exactly one retry.
    pub async fn reject(
        &self,
        delivery: &DeliveryHandle,
        redelivered: bool,
        context: NackContext<'_>,
        reason: &BrokerError,
    ) {
        let requeue = !redelivered;
        match delivery.nack(requeue).await {
            Ok(()) => {
                if requeue {
                    MetricsRegistry::incr(&self.metrics.nacked_requeue);
                } else {
                    MetricsRegistry::incr(&self.metrics.nacked_dropped);
                }
                warn!(
                    batch_id = context.batch_id.map(display),
                    partition_key = context.partition_key,
                    message_id = context.message_id,
                    delivery_id = delivery.id(),
                    delivery_tag = delivery.tag(),
                    requeue,
                    reason = %reason,
                    "Nacked delivery"
                );
            }
            Err(e) => {
                let e = BrokerError::AckError(e.to_string());
                error!(
                    batch_id = context.batch_id.map(display),
                    partition_key = context.partition_key,
                    message_id = context.message_id,
                    delivery_id = delivery.id(),
                    delivery_tag = delivery.tag(),
                    error = %e,
                    "Failed to nack delivery"
                );
            }
        }
    }
}

#[async_trait]
impl BatchCompletion for AckCoordinator {
    async fn complete(&self, batch: ReleasedBatch, result: Result<()>) {
        let events: Vec<InboundEvent> = batch
            .events
            .into_iter()
            .filter(|event| self.untrack(&batch.partition_key, &event.delivery))
            .collect();

        match result {
            Ok(()) => {
                let acks = join_all(events.iter().map(|event| event.delivery.ack())).await;
                let mut acked = 0u64;
                for (event, outcome) in events.iter().zip(acks) {
                    match outcome {
                        Ok(()) => acked += 1,
                        Err(e) => {
                            let e = BrokerError::AckError(e.to_string());
                            error!(
                                batch_id = %batch.batch_id,
                                message_id = %event.message_id,
                                error = %e,
                                "Failed to ack delivery"
                            );
                        }
                    }
                }
                MetricsRegistry::add(&self.metrics.acked, acked);
                info!(
                    batch_id = %batch.batch_id,
                    partition_key = %batch.partition_key,
                    acked,
                    "Acked batch"
                );
            }
            Err(e) => {
                MetricsRegistry::incr(&self.metrics.handler_failures);
                error!(
                    batch_id = %batch.batch_id,
                    partition_key = %batch.partition_key,
                    error = %e,
                    "Handler failed, settling batch with nack"
                );
                for event in &events {
                    let context = NackContext::for_event(batch.batch_id, event);
                    self.reject(&event.delivery, event.redelivered, context, &e).await;
                }
            }
        }
    }
}

/// Owns the inbound subscription. Registered as a connection listener so it
/// re-subscribes after every reconnect.
pub struct MessageConsumer {
    supervisor: ConnectionSupervisor,
    batching: BatchConfig,
    acks: Arc<AckCoordinator>,
    metrics: Arc<MetricsRegistry>,
    accumulator: Mutex<Option<Arc<BatchAccumulator>>>,
    consume_task: Mutex<Option<JoinHandle<()>>>,
    // Connection generation the running consume task belongs to; 0 = none.
    subscribed_generation: AtomicU64,
    subscribe_lock: tokio::sync::Mutex<()>,
}

impl MessageConsumer {
    pub fn new(
        supervisor: ConnectionSupervisor,
        batching: BatchConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let consumer = Arc::new(Self {
            supervisor: supervisor.clone(),
            batching,
            acks: Arc::new(AckCoordinator::new(metrics.clone())),
            metrics,
            accumulator: Mutex::new(None),
            consume_task: Mutex::new(None),
            subscribed_generation: AtomicU64::new(0),
            subscribe_lock: tokio::sync::Mutex::new(()),
        });
        supervisor.register_listener(&consumer);
        consumer
    }

    /// Registers the batch handler and starts consuming. When the broker is
    /// not reachable yet, consumption starts with the next connect.
    pub async fn start(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        {
            let mut slot = lock(&self.accumulator);
            if slot.is_some() {
                return Err(BrokerError::Configuration(
                    "an inbound handler is already registered".to_string(),
                ));
            }
            *slot = Some(BatchAccumulator::new(
                self.batching.clone(),
                handler,
                self.acks.clone(),
                self.metrics.clone(),
            ));
        }

        if self.supervisor.is_connected() {
            self.subscribe().await
        } else {
            info!("Not connected yet, consumer will start on connect");
            Ok(())
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.accumulator).is_some()
    }

    pub fn acks(&self) -> &AckCoordinator {
        &self.acks
    }

    async fn subscribe(&self) -> Result<()> {
        let Some(accumulator) = lock(&self.accumulator).clone() else {
            return Ok(());
        };
        let _serial = self.subscribe_lock.lock().await;

        // One consumer per connection; start() and on_connected() can both
        // arrive here for the same generation.
        let current = self.supervisor.generation();
        let consuming = lock(&self.consume_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if consuming && self.subscribed_generation.load(Ordering::SeqCst) == current {
            debug!(generation = current, "Already consuming on this connection");
            return Ok(());
        }

        let (generation, mut stream) = self.supervisor.consume(self.batching.prefetch()).await?;
        info!(
            queue = %self.supervisor.topology().queue,
            prefetch = self.batching.prefetch(),
            generation,
            "Consuming inbound queue"
        );

        let acks = self.acks.clone();
        let metrics = self.metrics.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(raw) => on_message(&accumulator, &acks, &metrics, raw).await,
                    Err(e) => {
                        error!(error = %e, "Consumer stream failed");
                        break;
                    }
                }
            }
            debug!("Consumer stream ended");
        });

        if let Some(previous) = lock(&self.consume_task).replace(task) {
            previous.abort();
        }
        self.subscribed_generation.store(generation, Ordering::SeqCst);
        Ok(())
    }
}

/// Parses one delivery and buffers it. Only a rejection awaits here; the
/// handler itself runs on the accumulator's release tasks.
async fn on_message(
    accumulator: &BatchAccumulator,
    acks: &AckCoordinator,
    metrics: &MetricsRegistry,
    raw: RawDelivery,
) {
    MetricsRegistry::incr(&metrics.messages_received);

    let event = match InboundEvent::parse(&raw) {
        Ok(event) => event,
        Err(e) => {
            MetricsRegistry::incr(&metrics.parse_failures);
            let message_id = peek_message_id(&raw.data);
            let context = NackContext {
                message_id: message_id.as_deref(),
                ..NackContext::default()
            };
            acks.reject(&raw.handle, raw.redelivered, context, &e).await;
            return;
        }
    };

    debug!(
        partition_key = %event.partition_key,
        message_id = %event.message_id,
        delivery_id = event.delivery.id(),
        delivery_tag = event.delivery.tag(),
        redelivered = event.redelivered,
        "Received message"
    );

    acks.track(&event.partition_key, &event.delivery);
    if let Err(event) = accumulator.add(event) {
        acks.untrack(&event.partition_key, &event.delivery);
        // Back on the queue for whoever consumes after us.
        if let Err(e) = event.delivery.nack(true).await {
            error!(
                partition_key = %event.partition_key,
                message_id = %event.message_id,
                delivery_id = event.delivery.id(),
                error = %e,
                "Failed to nack delivery"
            );
        } else {
            MetricsRegistry::incr(&metrics.nacked_requeue);
        }
    }
}

#[async_trait]
impl ConnectionListener for MessageConsumer {
    async fn on_connected(&self) {
        if !self.is_started() {
            return;
        }
        if let Err(e) = self.subscribe().await {
            error!(error = %e, "Failed to re-subscribe after connect");
        }
    }

    async fn on_shutdown(&self) {
        if let Some(task) = lock(&self.consume_task).take() {
            task.abort();
        }
        let accumulator = lock(&self.accumulator).clone();
        if let Some(accumulator) = accumulator {
            let abandoned = accumulator.abandon_all();
            if abandoned > 0 {
                warn!(abandoned, "Pending batches abandoned, their deliveries will be redelivered");
            }
            accumulator.wait_idle().await;
        }
    }
}
