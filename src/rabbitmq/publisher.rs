// src/rabbitmq/publisher.rs
//
// Outbound publishing with a bounded in-memory retry queue. A publish that
// cannot go out directly is parked and resent by a periodic worker until it
// succeeds or runs out of attempts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::connection::{lock, ConnectionListener, ConnectionSupervisor};
use super::errors::{BrokerError, Result};
use super::metrics::MetricsRegistry;
use crate::config::RetryConfig;
use crate::message::{OutboundEnvelope, OutboundKind};

/// Bounded FIFO that evicts its oldest entry when full.
#[derive(Debug)]
pub struct RetryQueue {
    capacity: usize,
    items: VecDeque<OutboundEnvelope>,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends `envelope`, returning the evicted oldest entry if the queue
    /// was already full.
    pub fn push(&mut self, envelope: OutboundEnvelope) -> Option<OutboundEnvelope> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(envelope);
        evicted
    }

    /// Puts untried envelopes back at the head, keeping their order.
    pub fn restore(&mut self, envelopes: Vec<OutboundEnvelope>) -> Vec<OutboundEnvelope> {
        for envelope in envelopes.into_iter().rev() {
            self.items.push_front(envelope);
        }
        let overflow = self.items.len().saturating_sub(self.capacity);
        self.items.drain(..overflow).collect()
    }

    pub fn take(&mut self, n: usize) -> Vec<OutboundEnvelope> {
        let n = n.min(self.items.len());
        self.items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Age of the envelope that has been waiting longest. Requeued envelopes
    /// keep their original queue time, so this is not always the head.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.items.iter().map(OutboundEnvelope::age).max()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundEnvelope> {
        self.items.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub size: usize,
    pub oldest_pending_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    Queued,
}

/// What one pass of the retry worker did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sent: usize,
    pub requeued: usize,
    pub dropped: usize,
}

pub struct RetryPublisher {
    supervisor: ConnectionSupervisor,
    config: RetryConfig,
    queue: Mutex<RetryQueue>,
    metrics: Arc<MetricsRegistry>,
    cycle_running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    me: Weak<RetryPublisher>,
}

impl RetryPublisher {
    pub fn new(
        supervisor: ConnectionSupervisor,
        config: RetryConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let publisher = Arc::new_cyclic(|me| Self {
            supervisor: supervisor.clone(),
            queue: Mutex::new(RetryQueue::new(config.max_queue_size)),
            config,
            metrics,
            cycle_running: AtomicBool::new(false),
            worker: Mutex::new(None),
            me: me.clone(),
        });
        supervisor.register_listener(&publisher);
        publisher
    }

    /// Fire-and-forget publish. Only the direct attempt happens inline;
    /// anything that fails is queued and retried in the background.
    pub async fn publish(&self, kind: OutboundKind, payload: Value) -> PublishOutcome {
        let mut envelope = OutboundEnvelope::new(kind, payload);

        if self.supervisor.is_connected() {
            match self.send(&envelope).await {
                Ok(()) => {
                    MetricsRegistry::incr(&self.metrics.published_direct);
                    debug!(envelope_id = %envelope.id, kind = %kind, "Published message");
                    return PublishOutcome::Sent;
                }
                Err(e) => {
                    envelope.record_attempt();
                    warn!(
                        envelope_id = %envelope.id,
                        kind = %kind,
                        error = %e,
                        "Direct publish failed, queueing for retry"
                    );
                }
            }
        } else {
            debug!(envelope_id = %envelope.id, kind = %kind, "Not connected, queueing message");
        }

        if envelope.attempts >= self.config.max_attempts {
            self.drop_envelope(&envelope);
        } else {
            MetricsRegistry::incr(&self.metrics.publishes_queued);
            self.enqueue(envelope);
        }
        PublishOutcome::Queued
    }

    pub async fn publish_json<T: Serialize>(&self, kind: OutboundKind, payload: &T) -> Result<PublishOutcome> {
        let value = serde_json::to_value(payload)?;
        Ok(self.publish(kind, value).await)
    }

    /// One pass over the retry queue. Returns `None` when skipped, either
    /// because the broker is down or another pass is still running.
    pub async fn run_retry_cycle(&self) -> Option<CycleReport> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Retry cycle already running");
            return None;
        }
        let _running = CycleGuard(&self.cycle_running);

        if !self.supervisor.is_connected() {
            debug!("Not connected, skipping retry cycle");
            return None;
        }

        let batch = lock(&self.queue).take(self.config.batch_size);
        if batch.is_empty() {
            return Some(CycleReport::default());
        }
        debug!(envelopes = batch.len(), "Running retry cycle");

        let mut report = CycleReport::default();
        let mut remaining = batch.into_iter();
        while let Some(mut envelope) = remaining.next() {
            match self.send(&envelope).await {
                Ok(()) => {
                    report.sent += 1;
                    MetricsRegistry::incr(&self.metrics.retry_successes);
                    info!(
                        envelope_id = %envelope.id,
                        kind = %envelope.kind,
                        attempts = envelope.attempts + 1,
                        "Delivered queued message"
                    );
                }
                // The loss event may not have reached the supervisor yet, so
                // the error decides. Nothing was really tried.
                Err(e) if e.is_connection_loss() => {
                    let untried: Vec<OutboundEnvelope> =
                        std::iter::once(envelope).chain(remaining).collect();
                    report.requeued += untried.len();
                    warn!(error = %e, envelopes = untried.len(), "Connection lost during retry cycle");
                    self.restore(untried);
                    break;
                }
                Err(e) => {
                    envelope.record_attempt();
                    MetricsRegistry::incr(&self.metrics.retry_failures);
                    if envelope.attempts < self.config.max_attempts {
                        warn!(
                            envelope_id = %envelope.id,
                            attempts = envelope.attempts,
                            error = %e,
                            "Retry failed, requeueing"
                        );
                        report.requeued += 1;
                        self.enqueue(envelope);
                    } else {
                        report.dropped += 1;
                        self.drop_envelope(&envelope);
                    }
                }
            }
        }
        Some(report)
    }

    /// Spawns the periodic retry worker unless it is already running.
    pub fn start_retry_worker(&self) {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if self.supervisor.is_shutting_down() {
            return;
        }

        let me = self.me.clone();
        let supervisor = self.supervisor.clone();
        let period = self.config.retry_interval();
        info!(interval_ms = period.as_millis() as u64, "Starting retry worker");

        *worker = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = supervisor.shutdown_requested() => break,
                }
                let Some(publisher) = me.upgrade() else { break };
                publisher.run_retry_cycle().await;
            }
            debug!("Retry worker stopped");
        }));
    }

    pub fn queue_status(&self) -> QueueStatus {
        let queue = lock(&self.queue);
        QueueStatus {
            size: queue.len(),
            oldest_pending_age_ms: queue.oldest_age().map(|age| age.as_millis() as u64),
        }
    }

    async fn send(&self, envelope: &OutboundEnvelope) -> Result<()> {
        let body = serde_json::to_vec(&envelope.payload)?;
        self.supervisor
            .publish(envelope.kind, envelope.id, envelope.attempts + 1, &body)
            .await
    }

    fn enqueue(&self, envelope: OutboundEnvelope) {
        let (evicted, capacity) = {
            let mut queue = lock(&self.queue);
            (queue.push(envelope), queue.capacity())
        };
        if let Some(evicted) = evicted {
            self.log_eviction(&evicted, capacity);
        }
    }

    fn restore(&self, envelopes: Vec<OutboundEnvelope>) {
        let (evicted, capacity) = {
            let mut queue = lock(&self.queue);
            (queue.restore(envelopes), queue.capacity())
        };
        for envelope in &evicted {
            self.log_eviction(envelope, capacity);
        }
    }

    fn log_eviction(&self, envelope: &OutboundEnvelope, capacity: usize) {
        MetricsRegistry::incr(&self.metrics.envelopes_evicted);
        let e = BrokerError::QueueOverflow { capacity };
        warn!(
            envelope_id = %envelope.id,
            kind = %envelope.kind,
            attempts = envelope.attempts,
            error = %e,
            "Evicted oldest queued message"
        );
    }

    fn drop_envelope(&self, envelope: &OutboundEnvelope) {
        MetricsRegistry::incr(&self.metrics.envelopes_dropped);
        error!(
            envelope_id = %envelope.id,
            kind = %envelope.kind,
            attempts = envelope.attempts,
            first_attempt_at = %envelope.first_attempt_at,
            payload = %envelope.payload,
            "Giving up on message after max attempts"
        );
    }
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionListener for RetryPublisher {
    async fn on_connected(&self) {
        self.start_retry_worker();
        // Flush what piled up during the outage without waiting a full interval.
        if let Some(publisher) = self.me.upgrade() {
            tokio::spawn(async move {
                publisher.run_retry_cycle().await;
            });
        }
    }

    async fn on_shutdown(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        let left = lock(&self.queue).len();
        if left > 0 {
            warn!(envelopes = left, "Shutting down with undelivered messages in the retry queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ReconnectConfig, TopologyConfig};
    use crate::rabbitmq::memory::MemoryTransport;
    use serde_json::json;
    use tokio::time::sleep;

    fn retry_config(max_queue_size: usize) -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            retry_interval_ms: 1_000,
            max_queue_size,
            batch_size: 50,
        }
    }

    fn setup(max_queue_size: usize) -> (MemoryTransport, ConnectionSupervisor, Arc<RetryPublisher>, Arc<MetricsRegistry>) {
        let transport = MemoryTransport::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let supervisor = ConnectionSupervisor::new(
            Arc::new(transport.clone()),
            ConnectionConfig::default(),
            TopologyConfig::default(),
            ReconnectConfig::default(),
            metrics.clone(),
        );
        let publisher = RetryPublisher::new(supervisor.clone(), retry_config(max_queue_size), metrics.clone());
        (transport, supervisor, publisher, metrics)
    }

    fn queued_texts(publisher: &RetryPublisher) -> Vec<String> {
        lock(&publisher.queue)
            .iter()
            .map(|envelope| envelope.payload["text"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn queue_evicts_oldest_when_full() {
        let mut queue = RetryQueue::new(2);
        assert!(queue.push(OutboundEnvelope::new(OutboundKind::Reply, json!("A"))).is_none());
        assert!(queue.push(OutboundEnvelope::new(OutboundKind::Reply, json!("B"))).is_none());
        let evicted = queue.push(OutboundEnvelope::new(OutboundKind::Reply, json!("C"))).unwrap();
        assert_eq!(evicted.payload, json!("A"));
        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.len(), 2);

        let rest: Vec<Value> = queue.take(10).into_iter().map(|e| e.payload).collect();
        assert_eq!(rest, vec![json!("B"), json!("C")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn restore_keeps_order_and_capacity() {
        let mut queue = RetryQueue::new(3);
        queue.push(OutboundEnvelope::new(OutboundKind::Status, json!(3)));
        queue.push(OutboundEnvelope::new(OutboundKind::Status, json!(4)));
        let evicted = queue.restore(vec![
            OutboundEnvelope::new(OutboundKind::Status, json!(1)),
            OutboundEnvelope::new(OutboundKind::Status, json!(2)),
        ]);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].payload, json!(1));
        let order: Vec<Value> = queue.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(order, vec![json!(2), json!(3), json!(4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_during_outage_keeps_newest() {
        let (transport, _supervisor, publisher, metrics) = setup(2);
        for text in ["A", "B", "C"] {
            let outcome = publisher.publish(OutboundKind::Reply, json!({ "text": text })).await;
            assert_eq!(outcome, PublishOutcome::Queued);
        }

        assert_eq!(queued_texts(&publisher), vec!["B", "C"]);
        assert_eq!(metrics.snapshot().envelopes_evicted, 1);
        assert_eq!(transport.publish_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_during_outage_is_delivered_after_connect() {
        let (transport, supervisor, publisher, metrics) = setup(10);
        let outcome = publisher.publish(OutboundKind::Error, json!({ "text": "down" })).await;
        assert_eq!(outcome, PublishOutcome::Queued);

        supervisor.connect().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "chat.outbound.error");
        assert_eq!(published[0].attempt, 1);
        assert_eq!(published[0].json(), json!({ "text": "down" }));
        assert_eq!(publisher.queue_status().size, 0);
        assert_eq!(metrics.snapshot().retry_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_publish_when_connected() {
        let (transport, supervisor, publisher, metrics) = setup(10);
        supervisor.connect().await.unwrap();

        let outcome = publisher.publish(OutboundKind::Status, json!({ "text": "ok" })).await;
        assert_eq!(outcome, PublishOutcome::Sent);
        assert_eq!(transport.published()[0].routing_key, "chat.outbound.status");
        assert_eq!(metrics.snapshot().published_direct, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_after_max_attempts() {
        let (transport, supervisor, publisher, metrics) = setup(10);
        supervisor.connect().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        transport.fail_next_publishes(10);

        let outcome = publisher.publish(OutboundKind::Reply, json!({ "text": "x" })).await;
        assert_eq!(outcome, PublishOutcome::Queued);
        assert_eq!(lock(&publisher.queue).iter().next().map(|e| e.attempts), Some(1));

        let first = publisher.run_retry_cycle().await.unwrap();
        assert_eq!(first, CycleReport { sent: 0, requeued: 1, dropped: 0 });

        let second = publisher.run_retry_cycle().await.unwrap();
        assert_eq!(second, CycleReport { sent: 0, requeued: 0, dropped: 1 });

        assert_eq!(transport.publish_attempts(), 3);
        assert_eq!(publisher.queue_status().size, 0);
        assert_eq!(metrics.snapshot().envelopes_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_mid_cycle_requeues_without_counting() {
        let (transport, supervisor, publisher, metrics) = setup(10);
        for text in ["A", "B", "C"] {
            publisher.publish(OutboundKind::Reply, json!({ "text": text })).await;
        }

        // Drop before the supervisor has seen either the connect flush or
        // the loss event.
        supervisor.connect().await.unwrap();
        transport.drop_connection();
        let report = publisher.run_retry_cycle().await;

        assert_eq!(report, Some(CycleReport { sent: 0, requeued: 3, dropped: 0 }));
        assert_eq!(queued_texts(&publisher), vec!["A", "B", "C"]);
        let attempts: Vec<u32> = lock(&publisher.queue).iter().map(|e| e.attempts).collect();
        assert_eq!(attempts, vec![0, 0, 0]);
        assert_eq!(metrics.snapshot().retry_failures, 0);
        assert!(transport.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_does_not_overlap_or_run_disconnected() {
        let (_transport, supervisor, publisher, _metrics) = setup(10);
        assert_eq!(publisher.run_retry_cycle().await, None);

        supervisor.connect().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        publisher.cycle_running.store(true, Ordering::SeqCst);
        assert_eq!(publisher.run_retry_cycle().await, None);

        publisher.cycle_running.store(false, Ordering::SeqCst);
        assert_eq!(publisher.run_retry_cycle().await, Some(CycleReport::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_oldest_age() {
        let (_transport, _supervisor, publisher, _metrics) = setup(10);
        assert_eq!(
            publisher.queue_status(),
            QueueStatus { size: 0, oldest_pending_age_ms: None }
        );

        publisher.publish(OutboundKind::Reply, json!({ "text": "A" })).await;
        sleep(Duration::from_millis(1_500)).await;
        publisher.publish(OutboundKind::Reply, json!({ "text": "B" })).await;

        assert_eq!(
            publisher.queue_status(),
            QueueStatus { size: 2, oldest_pending_age_ms: Some(1_500) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn worker_retries_on_interval() {
        let (transport, supervisor, publisher, _metrics) = setup(10);
        supervisor.connect().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        transport.fail_next_publishes(1);

        publisher.publish(OutboundKind::Reply, json!({ "text": "later" })).await;
        assert!(transport.published().is_empty());

        sleep(Duration::from_millis(1_100)).await;
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_worker() {
        let (_transport, supervisor, publisher, _metrics) = setup(10);
        supervisor.connect().await.unwrap();
        supervisor.shutdown().await.unwrap();
        assert!(lock(&publisher.worker).is_none());
    }
}
