// src/rabbitmq/batch_processor.rs
//
// Per-partition-key batching of inbound chat events. A batch is released by
// whichever comes first: reaching `max_batch_size`, the debounce timer
// (`max_wait_ms` after the latest event) or the hard window (`window_ms`
// after the first event). The debounce re-arms on every arrival but its
// deadline is clamped to the window.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::lock;
use super::errors::{BrokerError, Result};
use super::metrics::MetricsRegistry;
use crate::config::BatchConfig;
use crate::message::{CombinedEvent, InboundEvent};

/// Business-layer callback for released batches.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, event: CombinedEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> InboundHandler for F
where
    F: Fn(CombinedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: CombinedEvent) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// Receives every released batch together with the handler's result.
#[async_trait]
pub trait BatchCompletion: Send + Sync {
    async fn complete(&self, batch: ReleasedBatch, result: Result<()>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseTrigger {
    Size,
    Window,
    Debounce,
    Manual,
}

/// The events of one batch after it left the accumulator.
#[derive(Debug)]
pub struct ReleasedBatch {
    pub batch_id: Uuid,
    pub partition_key: String,
    pub events: Vec<InboundEvent>,
    pub trigger: ReleaseTrigger,
}

struct PendingBatch {
    batch_id: Uuid,
    events: Vec<InboundEvent>,
    first_event_at: Instant,
    timer: Option<JoinHandle<()>>,
    timer_seq: u64,
}

pub struct BatchAccumulator {
    config: BatchConfig,
    pending: Mutex<HashMap<String, PendingBatch>>,
    handler: Arc<dyn InboundHandler>,
    completion: Arc<dyn BatchCompletion>,
    metrics: Arc<MetricsRegistry>,
    active_releases: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    me: Weak<BatchAccumulator>,
}

impl BatchAccumulator {
    pub fn new(
        config: BatchConfig,
        handler: Arc<dyn InboundHandler>,
        completion: Arc<dyn BatchCompletion>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            pending: Mutex::new(HashMap::new()),
            handler,
            completion,
            metrics,
            active_releases: AtomicUsize::new(0),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Buffers an event under its partition key. Hitting the size or window
    /// limit releases the batch on its own task, so the caller never waits
    /// for the handler. Hands the event back once `abandon_all` has closed
    /// the accumulator.
    pub fn add(&self, event: InboundEvent) -> std::result::Result<(), InboundEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(event);
        }

        let now = Instant::now();
        let key = event.partition_key.clone();

        let released = {
            let mut pending = lock(&self.pending);
            let batch = pending.entry(key.clone()).or_insert_with(|| {
                let batch_id = Uuid::new_v4();
                debug!(partition_key = %key, batch_id = %batch_id, "Opened batch");
                PendingBatch {
                    batch_id,
                    events: Vec::with_capacity(self.config.max_batch_size),
                    first_event_at: now,
                    timer: None,
                    timer_seq: 0,
                }
            });

            debug!(
                partition_key = %key,
                batch_id = %batch.batch_id,
                message_id = %event.message_id,
                "Buffered event"
            );
            batch.events.push(event);

            let size_hit = batch.events.len() >= self.config.max_batch_size;
            let window_hit = now.duration_since(batch.first_event_at) > self.config.window();
            let released = if size_hit || window_hit {
                let trigger = if size_hit { ReleaseTrigger::Size } else { ReleaseTrigger::Window };
                pending.remove(&key).map(|batch| (batch, trigger))
            } else {
                self.arm_timer(&key, batch, now);
                None
            };

            MetricsRegistry::set(&self.metrics.pending_batches, pending.len() as u64);
            released
        };

        if let Some((mut batch, trigger)) = released {
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
            self.spawn_release(key, batch, trigger);
        }
        Ok(())
    }

    /// Releases whatever is pending for `key` and waits for the handler.
    /// Returns false when there was nothing to release.
    pub async fn release(&self, key: &str) -> bool {
        let Some(accumulator) = self.me.upgrade() else {
            return false;
        };
        let Some(batch) = self.take(key, None, None) else {
            return false;
        };
        let active = ActiveRelease::new(accumulator);
        self.process(key.to_string(), batch, ReleaseTrigger::Manual, active).await;
        true
    }

    fn arm_timer(&self, key: &str, batch: &mut PendingBatch, now: Instant) {
        if let Some(previous) = batch.timer.take() {
            previous.abort();
        }
        batch.timer_seq += 1;

        let debounce_at = now + self.config.max_wait();
        let window_at = batch.first_event_at + self.config.window();
        let (deadline, trigger) = if window_at <= debounce_at {
            (window_at, ReleaseTrigger::Window)
        } else {
            (debounce_at, ReleaseTrigger::Debounce)
        };

        let me = self.me.clone();
        let key = key.to_string();
        let batch_id = batch.batch_id;
        let seq = batch.timer_seq;
        batch.timer = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            let Some(accumulator) = me.upgrade() else { return };
            if let Some(batch) = accumulator.take(&key, Some(batch_id), Some(seq)) {
                let active = ActiveRelease::new(accumulator.clone());
                accumulator.process(key, batch, trigger, active).await;
            }
        }));
    }

    /// Removes the batch for `key` if it is still the one the caller meant.
    /// Whoever removes it processes it, so a size release and a timer
    /// release racing for the same batch handle it exactly once. Timer
    /// releases also carry the arm sequence, which makes a superseded timer
    /// a no-op.
    fn take(&self, key: &str, batch_id: Option<Uuid>, timer_seq: Option<u64>) -> Option<PendingBatch> {
        let mut batch = {
            let mut pending = lock(&self.pending);
            let current = pending.get(key).is_some_and(|batch| {
                batch_id.map_or(true, |id| id == batch.batch_id)
                    && timer_seq.map_or(true, |seq| seq == batch.timer_seq)
            });
            let taken = if current { pending.remove(key) } else { None };
            MetricsRegistry::set(&self.metrics.pending_batches, pending.len() as u64);
            taken
        };

        match batch.as_mut() {
            Some(batch) => {
                // A timer releasing its own batch must not abort itself.
                if let Some(timer) = batch.timer.take() {
                    if timer_seq.is_none() {
                        timer.abort();
                    }
                }
            }
            None => debug!(partition_key = %key, "Batch already released"),
        }
        batch
    }

    fn spawn_release(&self, key: String, batch: PendingBatch, trigger: ReleaseTrigger) {
        let Some(accumulator) = self.me.upgrade() else { return };
        let active = ActiveRelease::new(accumulator.clone());
        tokio::spawn(async move {
            accumulator.process(key, batch, trigger, active).await;
        });
    }

    async fn process(
        &self,
        key: String,
        mut batch: PendingBatch,
        trigger: ReleaseTrigger,
        _active: ActiveRelease,
    ) {
        let batch_id = batch.batch_id;
        let Some(combined) = CombinedEvent::merge(batch_id, &batch.events, &self.config.pair_connective)
        else {
            return;
        };
        MetricsRegistry::incr(&self.metrics.batches_released);

        info!(
            partition_key = %key,
            batch_id = %batch_id,
            events = batch.events.len(),
            trigger = ?trigger,
            "Releasing batch"
        );

        let result = match AssertUnwindSafe(self.handler.handle(combined)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BrokerError::from(e)),
            Err(_) => {
                error!(partition_key = %key, batch_id = %batch_id, "Handler panicked");
                Err(BrokerError::HandlerError("handler panicked".to_string()))
            }
        };

        let released = ReleasedBatch {
            batch_id,
            partition_key: key,
            events: std::mem::take(&mut batch.events),
            trigger,
        };
        self.completion.complete(released, result).await;
    }

    /// Cancels every pending timer without releasing its batch and stops
    /// accepting events. Returns how many batches were abandoned.
    pub fn abandon_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(String, PendingBatch)> = lock(&self.pending).drain().collect();

        for (key, batch) in &drained {
            if let Some(timer) = &batch.timer {
                timer.abort();
            }
            warn!(
                partition_key = %key,
                batch_id = %batch.batch_id,
                events = batch.events.len(),
                "Abandoning batch on shutdown"
            );
        }

        MetricsRegistry::add(&self.metrics.batches_abandoned, drained.len() as u64);
        MetricsRegistry::set(&self.metrics.pending_batches, 0);
        drained.len()
    }

    /// Waits until no release is running its handler.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active_releases.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn pending_events(&self, key: &str) -> usize {
        lock(&self.pending).get(key).map_or(0, |batch| batch.events.len())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Counts a release from the moment its batch leaves the map until the
/// completion callback has returned.
struct ActiveRelease(Arc<BatchAccumulator>);

impl ActiveRelease {
    fn new(accumulator: Arc<BatchAccumulator>) -> Self {
        accumulator.active_releases.fetch_add(1, Ordering::SeqCst);
        Self(accumulator)
    }
}

impl Drop for ActiveRelease {
    fn drop(&mut self) {
        if self.0.active_releases.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
