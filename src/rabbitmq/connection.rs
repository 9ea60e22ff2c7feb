// src/rabbitmq/connection.rs
//
// Owns the logical broker connection: connect/reconnect/shutdown and the
// single-writer publish path. Transport adapters never drive state directly;
// they report through `EventSink`, which lands in `handle_transport_event`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpTransport, DeliveryStream, EventSink, OutboundMessage, TransportEvent};
use super::errors::{BrokerError, Result};
use super::metrics::MetricsRegistry;
use crate::config::{ConnectionConfig, ReconnectConfig, TopologyConfig};
use crate::message::OutboundKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectStarted,
    Connected,
    ConnectFailed,
    ConnectionLost,
    ReconnectScheduled,
    ReconnectAbandoned,
    ShutdownRequested,
    Closed,
}

/// The connection state machine. `ShuttingDown` only ever leaves through
/// `Closed`, and `Disconnected` after shutdown is terminal because the
/// supervisor refuses to connect again.
pub fn transition(state: ConnectionState, event: ConnectionEvent) -> ConnectionState {
    use ConnectionEvent as E;
    use ConnectionState::*;

    match (state, event) {
        (ShuttingDown, E::Closed) => Disconnected,
        (ShuttingDown, _) => ShuttingDown,
        (_, E::ShutdownRequested) => ShuttingDown,
        (Reconnecting, E::ConnectStarted) => Reconnecting,
        (_, E::ConnectStarted) => Connecting,
        (_, E::Connected) => Connected,
        (Reconnecting, E::ConnectFailed) => Reconnecting,
        (_, E::ConnectFailed) => Disconnected,
        (Connected, E::ConnectionLost) => Reconnecting,
        (current, E::ConnectionLost) => current,
        (_, E::ReconnectScheduled) => Reconnecting,
        (_, E::ReconnectAbandoned) => Disconnected,
        (_, E::Closed) => Disconnected,
    }
}

/// Delay before reconnect attempt `attempt` (0-based):
/// `min(max, base * 2^min(attempt, 10))` plus up to `jitter_factor` of that.
pub fn reconnect_delay(config: &ReconnectConfig, attempt: u32, unit_random: f64) -> Duration {
    let exponent = attempt.min(10);
    let backoff = config
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_delay_ms);
    let jitter = config.jitter_factor * backoff as f64 * unit_random.clamp(0.0, 1.0);
    Duration::from_millis(backoff + jitter as u64)
}

/// Components that must react to the connection coming up or going away.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// Called after every successful `connect()`, including reconnects.
    async fn on_connected(&self);

    /// Called once during `shutdown()`, inside the grace period.
    async fn on_shutdown(&self) {}
}

struct SupervisorInner {
    transport: Arc<dyn AmqpTransport>,
    connection: ConnectionConfig,
    topology: TopologyConfig,
    reconnect: ReconnectConfig,
    metrics: Arc<MetricsRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    generation: AtomicU64,
    lost_generation: AtomicU64,
    reconnect_attempt: AtomicU32,
    reconnecting: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<()>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    listeners: Mutex<Vec<Weak<dyn ConnectionListener>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn AmqpTransport>,
        connection: ConnectionConfig,
        topology: TopologyConfig,
        reconnect: ReconnectConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(SupervisorInner {
                transport,
                connection,
                topology,
                reconnect,
                metrics,
                state_tx,
                shutdown_tx,
                generation: AtomicU64::new(0),
                lost_generation: AtomicU64::new(0),
                reconnect_attempt: AtomicU32::new(0),
                reconnecting: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                listeners: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Bumped on every connect attempt.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn topology(&self) -> &TopologyConfig {
        &self.inner.topology
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Resolves once the state equals `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Resolves once `shutdown()` has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.inner.shutdown_tx.subscribe();
        let _ = rx.wait_for(|flag| *flag).await;
    }

    pub fn register_listener<L>(&self, listener: &Arc<L>)
    where
        L: ConnectionListener + 'static,
    {
        let listener: Arc<dyn ConnectionListener> = listener.clone();
        lock(&self.inner.listeners).push(Arc::downgrade(&listener));
    }

    /// Idempotent: closes whatever is open, opens a fresh connection and
    /// channel, asserts topology and notifies listeners.
    #[instrument(skip(self), fields(generation = tracing::field::Empty))]
    pub async fn connect(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }

        let guard = self.inner.connect_lock.lock().await;
        self.ensure_event_watcher();
        self.apply(ConnectionEvent::ConnectStarted);

        // Bumping first makes any close event from the old connection stale.
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::Span::current().record("generation", generation);

        if let Err(e) = self.inner.transport.close().await {
            debug!(error = %e, "Ignoring error while closing previous connection");
        }

        let sink = EventSink::new(generation, self.inner.events_tx.clone());
        let opened = match timeout(
            self.inner.connection.connect_timeout(),
            self.inner.transport.open(&self.inner.topology, sink),
        )
        .await
        {
            Ok(result) => result,
            Err(elapsed) => Err(BrokerError::from(elapsed)),
        };

        if let Err(e) = opened {
            self.apply(ConnectionEvent::ConnectFailed);
            error!(error = %e, "Failed to connect to broker");
            return Err(match e {
                BrokerError::ConnectionError(_) => e,
                other => BrokerError::ConnectionError(other.to_string()),
            });
        }

        if self.is_shutting_down() {
            let _ = self.inner.transport.close().await;
            return Err(BrokerError::ShuttingDown);
        }

        if !self.mark_connected(generation) {
            warn!("Connection dropped while it was being opened");
            return Err(BrokerError::ConnectionError(
                "connection lost during setup".to_string(),
            ));
        }
        info!(exchange = %self.inner.topology.exchange, "Connected to broker");
        drop(guard);

        for listener in self.live_listeners() {
            listener.on_connected().await;
        }
        Ok(())
    }

    /// Entry point for transport adapters (through `EventSink`).
    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionLost { generation, reason } => {
                if generation != self.inner.generation.load(Ordering::SeqCst) {
                    debug!(generation, reason = %reason, "Ignoring event from a replaced connection");
                    return;
                }
                if self.is_shutting_down() {
                    info!(reason = %reason, "Connection closed during shutdown");
                    return;
                }

                warn!(generation, reason = %reason, "Broker connection lost");
                self.inner.lost_generation.store(generation, Ordering::SeqCst);
                self.apply(ConnectionEvent::ConnectionLost);
                self.schedule_reconnect();
            }
        }
    }

    /// Starts the background reconnect loop unless one is already running
    /// or shutdown has begun.
    pub fn schedule_reconnect(&self) {
        if self.is_shutting_down() {
            return;
        }
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already in progress");
            return;
        }

        self.apply(ConnectionEvent::ReconnectScheduled);
        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            supervisor.reconnect_loop().await;
            supervisor.inner.reconnecting.store(false, Ordering::SeqCst);

            // A loss that arrived while the loop was finishing found the
            // flag still set; pick it up now.
            if supervisor.state() == ConnectionState::Reconnecting && !supervisor.is_shutting_down() {
                supervisor.schedule_reconnect();
            }
        });
        self.track_task(handle);
    }

    async fn reconnect_loop(&self) {
        loop {
            if self.is_shutting_down() {
                return;
            }

            let attempt = self.inner.reconnect_attempt.load(Ordering::SeqCst);
            if let Some(max) = self.inner.reconnect.max_attempts {
                if attempt >= max {
                    error!(attempts = attempt, "Max reconnection attempts reached. Giving up.");
                    self.apply(ConnectionEvent::ReconnectAbandoned);
                    return;
                }
            }

            let delay = reconnect_delay(&self.inner.reconnect, attempt, rand::random::<f64>());
            info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Waiting before next reconnect attempt"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_requested() => return,
            }

            MetricsRegistry::incr(&self.inner.metrics.reconnect_attempts);
            match self.connect().await {
                Ok(()) => {
                    self.inner.reconnect_attempt.store(0, Ordering::SeqCst);
                    MetricsRegistry::incr(&self.inner.metrics.reconnects);
                    info!(attempt = attempt + 1, "Reconnected to broker");
                    return;
                }
                Err(BrokerError::ShuttingDown) => return,
                Err(e) => {
                    self.inner.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
                    warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                }
            }
        }
    }

    /// Stops reconnection, gives listeners the grace period to drain, stops
    /// background tasks and closes channel and connection.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown_tx.send_replace(true) {
            debug!("Shutdown already requested");
            return Ok(());
        }
        info!("Shutting down broker connection");
        self.apply(ConnectionEvent::ShutdownRequested);

        let grace = self.inner.connection.shutdown_grace();
        let listeners = self.live_listeners();
        let drain = async {
            for listener in &listeners {
                listener.on_shutdown().await;
            }
        };
        if timeout(grace, drain).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed before in-flight work finished"
            );
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let _guard = self.inner.connect_lock.lock().await;
        let result = self.inner.transport.close().await;
        self.apply(ConnectionEvent::Closed);
        info!("Broker connection closed");
        result
    }

    /// Open the inbound consumer on the current channel. Runs under the
    /// connect lock, so the returned generation is the connection the
    /// stream belongs to.
    pub async fn consume(&self, prefetch: u16) -> Result<(u64, DeliveryStream)> {
        let _guard = self.inner.connect_lock.lock().await;
        if !self.is_connected() {
            return Err(BrokerError::ConnectionError("not connected".to_string()));
        }
        let generation = self.generation();
        let stream = self.inner.transport.consume(&self.inner.topology, prefetch).await?;
        Ok((generation, stream))
    }

    /// The single-writer publish path: every outbound message goes through
    /// one lock so the channel never sees interleaved writes.
    pub async fn publish(
        &self,
        kind: OutboundKind,
        message_id: Uuid,
        attempt: u32,
        payload: &[u8],
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::ConnectionError("not connected".to_string()));
        }

        let _writer = self.inner.writer.lock().await;
        self.inner
            .transport
            .publish(OutboundMessage {
                exchange: &self.inner.topology.exchange,
                routing_key: self.inner.topology.routing_key_for(kind),
                kind,
                message_id,
                attempt,
                payload,
            })
            .await
    }

    fn apply(&self, event: ConnectionEvent) -> ConnectionState {
        let mut next = ConnectionState::Disconnected;
        self.inner.state_tx.send_modify(|state| {
            let previous = *state;
            *state = transition(previous, event);
            next = *state;
            if previous != next {
                debug!(from = ?previous, to = ?next, event = ?event, "Connection state changed");
            }
        });
        next
    }

    /// Moves to `Connected` unless a loss was already reported for this
    /// generation. Checked under the state lock so the two cannot interleave.
    fn mark_connected(&self, generation: u64) -> bool {
        let mut connected = false;
        self.inner.state_tx.send_modify(|state| {
            let event = if self.inner.lost_generation.load(Ordering::SeqCst) == generation {
                ConnectionEvent::ConnectFailed
            } else {
                connected = true;
                ConnectionEvent::Connected
            };
            *state = transition(*state, event);
        });
        connected
    }

    fn ensure_event_watcher(&self) {
        let Some(mut rx) = lock(&self.inner.events_rx).take() else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                ConnectionSupervisor { inner }.handle_transport_event(event);
            }
        });
        self.track_task(handle);
    }

    fn live_listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        let mut listeners = lock(&self.inner.listeners);
        listeners.retain(|weak| weak.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

/// Poisoning only happens if a holder panicked; the data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
