//! Connection-resilience supervisor.
//!
//! Owns the live [`GatewayClient`], the [`ConnectionState`] machine and the
//! background tasks that keep the connection alive:
//!
//! ```text
//!  Disconnected ──start──▶ Connecting ──ready──▶ Connected
//!                              ▲                    │ disconnect / probe failure
//!                              │                    ▼
//!                              └──── rebuild ──── Reconnecting
//!
//!  any ──shutdown──▶ ShuttingDown (terminal)
//! ```
//!
//! - connection task: runs `connect` in a loop with a fixed retry delay,
//!   building a fresh client for every attempt after the first
//! - event pump: applies lifecycle events from the current client generation
//!   and forwards chat messages to the inbound pipeline
//! - health loop: see [`health`]
//!
//! Only one reconnect is ever in flight. [`Supervisor::force_reconnect`]
//! claims an epoch with a compare-and-swap and the claim is released when
//! the connection becomes ready or the task holding it exits.

pub mod health;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{
    ConnectError, EventSink, GatewayClient, GatewayEvent, GatewayFactory, StampedEvent,
};
use crate::config::RetryConfig;
use crate::inbound::InboundMessage;

pub use health::{HealthFailure, HealthMonitor, HealthOutcome, HealthSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

// ============================================================================
// SupervisorConfig
// ============================================================================

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub health_check_interval: Duration,
    pub reconnect_delay: Duration,
    pub passive_probe_timeout: Duration,
    pub active_probe_timeout: Duration,
    /// Minimum spacing between active probes.
    pub active_probe_interval: Duration,
    pub failure_threshold: u32,
    pub close_timeout: Duration,
    /// Pause between closing the old client and building the new one.
    pub settle_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            passive_probe_timeout: Duration::from_secs(3),
            active_probe_timeout: Duration::from_secs(30),
            active_probe_interval: Duration::from_secs(60),
            failure_threshold: 3,
            close_timeout: Duration::from_secs(3),
            settle_delay: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&RetryConfig> for SupervisorConfig {
    fn from(retry: &RetryConfig) -> Self {
        Self {
            health_check_interval: retry.connection_check_interval(),
            reconnect_delay: retry.retry_delay(),
            ..Self::default()
        }
    }
}

// ============================================================================
// SupervisorError
// ============================================================================

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("gateway rejected the credentials: {0}")]
    Authentication(ConnectError),

    #[error("supervisor already started")]
    AlreadyStarted,

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

// ============================================================================
// Supervisor
// ============================================================================

struct Inner {
    config: SupervisorConfig,
    factory: Arc<dyn GatewayFactory>,
    events_tx: mpsc::UnboundedSender<StampedEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StampedEvent>>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    client: watch::Sender<Arc<dyn GatewayClient>>,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    fatal: watch::Sender<Option<ConnectError>>,
    shutdown: CancellationToken,
    next_epoch: AtomicU64,
    /// Epoch of the reconnect in flight, 0 when none.
    in_flight: AtomicU64,
    connection_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn current_client(&self) -> Arc<dyn GatewayClient> {
        self.client.borrow().clone()
    }

    fn rebuild_client(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let client = self
            .factory
            .build(EventSink::new(generation, self.events_tx.clone()));
        self.client.send_replace(client);
        debug!(generation, "Built gateway client");
        generation
    }

    /// Move to `to` unless already there or shutting down.
    fn transition(&self, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == to || *state == ConnectionState::ShuttingDown {
                return false;
            }
            debug!(from = ?*state, to = ?to, "Connection state change");
            *state = to;
            true
        })
    }
}

/// Releases the in-flight reconnect claim when dropped, unless a newer one replaced it.
struct ReconnectGuard {
    inner: Arc<Inner>,
    epoch: u64,
}

impl Drop for ReconnectGuard {
    fn drop(&mut self) {
        let _ = self.inner.in_flight.compare_exchange(
            self.epoch,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Handle to the supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Build the supervisor and its first client. Nothing connects until [`start`](Self::start).
    pub fn new(
        config: SupervisorConfig,
        factory: Arc<dyn GatewayFactory>,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let generation = 1;
        let client = factory.build(EventSink::new(generation, events_tx.clone()));
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                inbound,
                client: watch::Sender::new(client),
                generation: AtomicU64::new(generation),
                state: watch::Sender::new(ConnectionState::Disconnected),
                fatal: watch::Sender::new(None),
                shutdown: CancellationToken::new(),
                next_epoch: AtomicU64::new(0),
                in_flight: AtomicU64::new(0),
                connection_task: tokio::sync::Mutex::new(None),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The current client. Replaced on every reconnect, so don't hold on to it.
    pub fn client(&self) -> Arc<dyn GatewayClient> {
        self.inner.current_client()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    /// Wait until connected. False on timeout or shutdown.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        let wait = async {
            rx.wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Connected | ConnectionState::ShuttingDown
                )
            })
            .await
            .map(|s| *s)
        };
        matches!(
            tokio::time::timeout(timeout, wait).await,
            Ok(Ok(ConnectionState::Connected))
        )
    }

    /// Resolves with the error that stopped the connection for good.
    pub async fn wait_fatal(&self) -> Option<ConnectError> {
        let mut rx = self.inner.fatal.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|e| (*e).clone())
    }

    /// Start the background tasks and wait for the first successful connection.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let inner = &self.inner;
        if self.state() == ConnectionState::ShuttingDown {
            return Err(SupervisorError::ShuttingDown);
        }
        let events = inner
            .events_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or(SupervisorError::AlreadyStarted)?;

        let mut state_rx = inner.state.subscribe();
        let mut fatal_rx = inner.fatal.subscribe();

        self.track(tokio::spawn(run_event_pump(self.clone(), events)));
        info!(generation = inner.generation(), "Starting gateway connection");
        self.spawn_connection(None).await;

        let connected = async {
            state_rx
                .wait_for(|s| {
                    matches!(
                        s,
                        ConnectionState::Connected | ConnectionState::ShuttingDown
                    )
                })
                .await
                .map(|s| *s)
        };
        let fatal = async {
            fatal_rx
                .wait_for(Option::is_some)
                .await
                .map(|e| (*e).clone())
        };

        let outcome = tokio::select! {
            state = connected => match state {
                Ok(ConnectionState::Connected) => Ok(()),
                _ => Err(SupervisorError::ShuttingDown),
            },
            error = fatal => match error {
                Ok(Some(e)) => Err(SupervisorError::Authentication(e)),
                _ => Err(SupervisorError::ShuttingDown),
            },
        };

        if outcome.is_ok() {
            self.track(tokio::spawn(health::run_health_loop(self.clone())));
        }
        outcome
    }

    /// Tear down the current client and start a fresh connection.
    ///
    /// No-op while reconnecting, shutting down, or when another reconnect
    /// holds the claim. Returns once the new connection task is running,
    /// without waiting for it to connect.
    pub async fn force_reconnect(&self) {
        let inner = &self.inner;
        match self.state() {
            ConnectionState::ShuttingDown => {
                debug!("Shutting down, not reconnecting");
                return;
            }
            ConnectionState::Reconnecting => {
                debug!("Reconnect already in progress");
                return;
            }
            _ => {}
        }

        let epoch = inner.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if inner
            .in_flight
            .compare_exchange(0, epoch, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in flight");
            return;
        }
        let guard = ReconnectGuard {
            inner: inner.clone(),
            epoch,
        };
        if !inner.transition(ConnectionState::Reconnecting) {
            return;
        }

        info!(generation = inner.generation(), epoch, "Forcing gateway reconnect");
        self.stop_connection_task().await;

        let old = inner.current_client();
        close_client(&*old, inner.config.close_timeout).await;

        tokio::select! {
            _ = tokio::time::sleep(inner.config.settle_delay) => {}
            _ = inner.shutdown.cancelled() => return,
        }

        inner.rebuild_client();
        self.spawn_connection(Some(guard)).await;
    }

    /// Stop everything. The supervisor cannot be restarted.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let previous = inner.state.send_replace(ConnectionState::ShuttingDown);
        if previous == ConnectionState::ShuttingDown {
            return;
        }
        info!("Shutting down gateway supervisor");
        inner.shutdown.cancel();

        let background = inner
            .background
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        let connection = inner.connection_task.lock().await.take();

        let stop = async {
            if let Some(handle) = connection {
                handle.abort();
                let _ = handle.await;
            }
            for handle in background {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(inner.config.shutdown_timeout, stop)
            .await
            .is_err()
        {
            warn!("Background tasks did not stop in time");
        }

        close_client(&*inner.current_client(), inner.config.close_timeout).await;
        info!("Gateway supervisor stopped");
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.inner.background.lock() {
            tasks.push(handle);
        }
    }

    async fn spawn_connection(&self, guard: Option<ReconnectGuard>) {
        let handle = tokio::spawn(run_connection(self.clone(), guard));
        let previous = self.inner.connection_task.lock().await.replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn stop_connection_task(&self) {
        let handle = self.inner.connection_task.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            if tokio::time::timeout(self.inner.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("Connection task did not stop in time");
            }
        }
    }

    fn handle_event(&self, stamped: StampedEvent) {
        let current = self.generation();
        match stamped.event {
            GatewayEvent::Message(message) => {
                if self.inner.inbound.send(message).is_err() {
                    debug!("Inbound receiver dropped, discarding message");
                }
            }
            event if stamped.generation != current => {
                debug!(
                    ?event,
                    generation = stamped.generation,
                    current,
                    "Ignoring event from replaced client"
                );
            }
            GatewayEvent::Ready => self.on_ready("ready"),
            GatewayEvent::Resumed => self.on_ready("resumed"),
            GatewayEvent::Disconnected => self.on_disconnect(),
        }
    }

    fn on_ready(&self, event: &'static str) {
        let inner = &self.inner;
        let connected = inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if connected {
            inner.in_flight.store(0, Ordering::SeqCst);
            info!(generation = inner.generation(), event, "Gateway connected");
        } else {
            debug!(state = ?self.state(), event, "Ready event does not change state");
        }
    }

    fn on_disconnect(&self) {
        if self.state() != ConnectionState::Connected {
            debug!(state = ?self.state(), "Disconnect event outside connected state");
            return;
        }
        warn!(generation = self.generation(), "Gateway disconnected unexpectedly");
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.force_reconnect().await });
    }
}

// ============================================================================
// Background tasks
// ============================================================================

async fn close_client(client: &dyn GatewayClient, timeout: Duration) {
    if tokio::time::timeout(timeout, client.close()).await.is_err() {
        warn!(
            timeout_secs = timeout.as_secs_f64(),
            "Closing gateway client timed out"
        );
    }
}

async fn run_event_pump(supervisor: Supervisor, mut events: mpsc::UnboundedReceiver<StampedEvent>) {
    let shutdown = supervisor.inner.shutdown.clone();
    debug!("Event pump started");
    loop {
        let stamped = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        supervisor.handle_event(stamped);
    }
    debug!("Event pump stopped");
}

async fn run_connection(supervisor: Supervisor, guard: Option<ReconnectGuard>) {
    let _guard = guard;
    let inner = &supervisor.inner;
    let delay = inner.config.reconnect_delay;
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            info!(attempt, delay_secs = delay.as_secs_f64(), "Retrying gateway connection");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.shutdown.cancelled() => break,
            }
            inner.rebuild_client();
        }
        if inner.shutdown.is_cancelled() {
            break;
        }

        inner.transition(ConnectionState::Connecting);
        let client = inner.current_client();
        let generation = inner.generation();
        let result = tokio::select! {
            result = client.connect() => result,
            _ = inner.shutdown.cancelled() => break,
        };

        match result {
            Ok(()) => {
                warn!(generation, "Gateway connection closed");
                inner.transition(ConnectionState::Reconnecting);
            }
            Err(e) if e.is_fatal() => {
                error!(
                    generation,
                    error = %e,
                    hint = e.kind.hint(),
                    "Gateway authentication failed, not retrying"
                );
                inner.transition(ConnectionState::Disconnected);
                inner.fatal.send_replace(Some(e));
                break;
            }
            Err(e) => {
                warn!(
                    generation,
                    attempt,
                    kind = %e.kind,
                    error = %e,
                    hint = e.kind.hint(),
                    "Gateway connection attempt failed"
                );
                inner.transition(ConnectionState::Reconnecting);
            }
        }
        attempt = attempt.saturating_add(1);
    }
    debug!("Connection task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ConnectErrorKind;
    use crate::testing::{ConnectStep, MockGateway};

    fn supervisor(gateway: &Arc<MockGateway>) -> Supervisor {
        let (tx, _rx) = mpsc::unbounded_channel();
        Supervisor::new(SupervisorConfig::default(), gateway.factory(), tx)
    }

    #[tokio::test(start_paused = true)]
    async fn start_resolves_once_connected() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        assert_eq!(sup.state(), ConnectionState::Disconnected);

        sup.start().await.unwrap();
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(gateway.builds(), 1);
        assert!(matches!(
            sup.start().await,
            Err(SupervisorError::AlreadyStarted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_authentication_failure_is_fatal() {
        let gateway = MockGateway::new();
        gateway.script_connect([ConnectStep::Fail(ConnectError::authentication(
            "401 Unauthorized",
        ))]);
        let sup = supervisor(&gateway);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Authentication(_)));
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        // No rebuild means no reconnect was ever attempted.
        assert_eq!(gateway.builds(), 1);
        assert_eq!(gateway.connects(), 1);
        assert!(sup.wait_fatal().await.unwrap().is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_fresh_clients() {
        let gateway = MockGateway::new();
        gateway.script_connect([
            ConnectStep::Fail(ConnectError::new(ConnectErrorKind::Timeout, "timed out")),
            ConnectStep::Fail(ConnectError::new(ConnectErrorKind::Dns, "dns failure")),
            ConnectStep::Ready,
        ]);
        let sup = supervisor(&gateway);

        let started = tokio::time::Instant::now();
        sup.start().await.unwrap();
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(gateway.builds(), 3);
        assert_eq!(gateway.connects(), 3);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_force_reconnect_runs_once() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        tokio::join!(sup.force_reconnect(), sup.force_reconnect());
        assert!(sup.wait_connected(Duration::from_secs(10)).await);
        assert_eq!(gateway.builds(), 2);
        assert_eq!(gateway.closes(), 1);
        assert_eq!(sup.generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_noop_while_reconnecting() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        // Second client never becomes ready, so the first reconnect stays in flight.
        gateway.script_connect([ConnectStep::Hang]);
        sup.force_reconnect().await;
        tokio::task::yield_now().await;
        assert_ne!(sup.state(), ConnectionState::Connected);
        sup.force_reconnect().await;
        assert_eq!(gateway.builds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_event_triggers_reconnect() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        gateway.emit_latest(GatewayEvent::Disconnected);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sup.wait_connected(Duration::from_secs(10)).await);
        assert_eq!(gateway.builds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_replaced_client_are_ignored() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();
        sup.force_reconnect().await;
        assert!(sup.wait_connected(Duration::from_secs(10)).await);
        assert_eq!(gateway.builds(), 2);

        gateway.emit_from(0, GatewayEvent::Disconnected);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(gateway.builds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_is_retried() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        gateway.drop_connection();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_ne!(sup.state(), ConnectionState::Connected);

        assert!(sup.wait_connected(Duration::from_secs(10)).await);
        assert_eq!(gateway.builds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connection_after_ready_is_reconnecting() {
        let gateway = MockGateway::new();
        gateway.script_connect([ConnectStep::ReadyThenFail(ConnectError::new(
            ConnectErrorKind::Io,
            "connection reset",
        ))]);
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        gateway.drop_connection();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.state(), ConnectionState::Reconnecting);

        // The retry loop owns the reconnect while it waits out the delay.
        sup.force_reconnect().await;
        assert_eq!(gateway.builds(), 1);

        assert!(sup.wait_connected(Duration::from_secs(10)).await);
        assert_eq!(gateway.builds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_messages_are_forwarded() {
        let gateway = MockGateway::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sup = Supervisor::new(SupervisorConfig::default(), gateway.factory(), tx);
        sup.start().await.unwrap();

        gateway.emit_latest(GatewayEvent::Message(crate::testing::inbound("m1", "c1")));
        let message = rx.recv().await.unwrap();
        assert_eq!(message.message_id, "m1");
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_probe_forces_reconnect() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        let mut monitor = HealthMonitor::new(3, Duration::from_secs(60));
        gateway.set_ready(false);
        assert_eq!(
            sup.check_health(&mut monitor).await,
            HealthOutcome::Reconnecting(HealthFailure::NotReady)
        );
        assert_ne!(sup.state(), ConnectionState::Connected);
        gateway.set_ready(true);
        assert!(sup.wait_connected(Duration::from_secs(10)).await);

        gateway.set_latency(Some(12.0));
        assert_eq!(
            sup.check_health(&mut monitor).await,
            HealthOutcome::Reconnecting(HealthFailure::UnstableLatency)
        );
        assert!(sup.wait_connected(Duration::from_secs(10)).await);
        assert_eq!(gateway.builds(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_skipped_when_not_connected() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        let mut monitor = HealthMonitor::new(3, Duration::from_secs(60));
        assert_eq!(
            sup.check_health(&mut monitor).await,
            HealthOutcome::Skipped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn third_spaced_active_failure_reconnects_once() {
        let gateway = MockGateway::new();
        gateway.set_fetch_self_ok(false);
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        // Checks run every 30s, active probes at most every 60s: t=30, 90, 150.
        tokio::time::sleep(Duration::from_secs(140)).await;
        assert_eq!(gateway.fetch_self_calls(), 2);
        assert_eq!(gateway.builds(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(gateway.fetch_self_calls(), 3);
        assert_eq!(gateway.builds(), 2);
        assert_eq!(sup.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_connected_times_out() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        assert!(!sup.wait_connected(Duration::from_secs(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_terminal() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        sup.shutdown().await;
        assert_eq!(sup.state(), ConnectionState::ShuttingDown);
        assert!(gateway.closes() >= 1);

        sup.force_reconnect().await;
        assert_eq!(gateway.builds(), 1);
        assert_eq!(sup.state(), ConnectionState::ShuttingDown);
        assert!(!sup.wait_connected(Duration::from_secs(1)).await);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_retry_loop() {
        let gateway = MockGateway::new();
        let io = || ConnectError::new(ConnectErrorKind::Io, "connection refused");
        gateway.script_connect([ConnectStep::ReadyThenFail(io())]);
        gateway.script_connect((0..10).map(|_| ConnectStep::Fail(io())));
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        gateway.drop_connection();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(gateway.builds(), 2);
        assert_eq!(sup.state(), ConnectionState::Reconnecting);

        let timeout = SupervisorConfig::default().shutdown_timeout;
        assert!(tokio::time::timeout(timeout, sup.shutdown()).await.is_ok());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.builds(), 2);
        assert_eq!(sup.state(), ConnectionState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_reconnect_releases_claim() {
        let gateway = MockGateway::new();
        let sup = supervisor(&gateway);
        sup.start().await.unwrap();

        gateway.script_connect([ConnectStep::Hang]);
        sup.force_reconnect().await;
        tokio::task::yield_now().await;
        assert_ne!(sup.inner.in_flight.load(Ordering::SeqCst), 0);

        sup.shutdown().await;
        assert_eq!(sup.inner.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_from_retry_section() {
        let retry = RetryConfig {
            retry_delay_seconds: 2,
            connection_check_interval_seconds: 10,
        };
        let config = SupervisorConfig::from(&retry);
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.health_check_interval, Duration::from_secs(10));
        assert_eq!(config.failure_threshold, 3);
    }
}
