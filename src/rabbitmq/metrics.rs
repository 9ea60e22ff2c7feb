//! Counters and gauges describing the broker layer.
//!
//! Every component holds an `Arc<MetricsRegistry>` and bumps plain atomics;
//! `snapshot()` is cheap enough to call from a health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    pub messages_received: AtomicU64,
    pub parse_failures: AtomicU64,
    pub acked: AtomicU64,
    pub nacked_requeue: AtomicU64,
    pub nacked_dropped: AtomicU64,
    pub batches_released: AtomicU64,
    pub batches_abandoned: AtomicU64,
    pub handler_failures: AtomicU64,
    pub pending_batches: AtomicU64,
    pub published_direct: AtomicU64,
    pub publishes_queued: AtomicU64,
    pub retry_successes: AtomicU64,
    pub retry_failures: AtomicU64,
    pub envelopes_dropped: AtomicU64,
    pub envelopes_evicted: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub reconnects: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub parse_failures: u64,
    pub acked: u64,
    pub nacked_requeue: u64,
    pub nacked_dropped: u64,
    pub batches_released: u64,
    pub batches_abandoned: u64,
    pub handler_failures: u64,
    pub pending_batches: u64,
    pub published_direct: u64,
    pub publishes_queued: u64,
    pub retry_successes: u64,
    pub retry_failures: u64,
    pub envelopes_dropped: u64,
    pub envelopes_evicted: u64,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_received: get(&self.messages_received),
            parse_failures: get(&self.parse_failures),
            acked: get(&self.acked),
            nacked_requeue: get(&self.nacked_requeue),
            nacked_dropped: get(&self.nacked_dropped),
            batches_released: get(&self.batches_released),
            batches_abandoned: get(&self.batches_abandoned),
            handler_failures: get(&self.handler_failures),
            pending_batches: get(&self.pending_batches),
            published_direct: get(&self.published_direct),
            publishes_queued: get(&self.publishes_queued),
            retry_successes: get(&self.retry_successes),
            retry_failures: get(&self.retry_failures),
            envelopes_dropped: get(&self.envelopes_dropped),
            envelopes_evicted: get(&self.envelopes_evicted),
            reconnect_attempts: get(&self.reconnect_attempts),
            reconnects: get(&self.reconnects),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = MetricsRegistry::new();
        MetricsRegistry::incr(&metrics.acked);
        MetricsRegistry::add(&metrics.acked, 2);
        MetricsRegistry::set(&metrics.pending_batches, 4);
        MetricsRegistry::set(&metrics.pending_batches, 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acked, 3);
        assert_eq!(snapshot.pending_batches, 1);
        assert_eq!(snapshot.nacked_dropped, 0);
    }
}
