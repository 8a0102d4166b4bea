//! Periodic connection health checks.
//!
//! A check has two tiers:
//!
//! - passive: closed flag, ready flag and heartbeat latency, cheap and local
//! - active: an authenticated round-trip, rate limited to once per
//!   `active_interval`
//!
//! Passive failures reconnect immediately. Active failures are counted and
//! only reconnect once the count reaches the threshold.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{ConnectionState, Supervisor};
use crate::client::GatewayClient;

/// Latencies at or above this many seconds mark the connection unstable.
pub const MAX_LATENCY_SECONDS: f64 = 10.0;

// ============================================================================
// Samples and verdicts
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    pub ready: bool,
    pub latency_seconds: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl HealthSample {
    pub fn new(ready: bool, latency_seconds: Option<f64>) -> Self {
        Self {
            ready,
            latency_seconds,
            observed_at: Utc::now(),
        }
    }
}

/// Finite, non-negative and below [`MAX_LATENCY_SECONDS`].
pub fn is_valid_latency(latency: Option<f64>) -> bool {
    latency.is_some_and(|l| l.is_finite() && l >= 0.0 && l < MAX_LATENCY_SECONDS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveVerdict {
    Healthy,
    NotReady,
    UnstableLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveVerdict {
    Healthy,
    Failing { failures: u32 },
    ThresholdReached,
}

/// Why a health check asked for a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthFailure {
    Closed,
    ProbeTimeout,
    NotReady,
    UnstableLatency,
    ActiveProbeFailures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Not connected, nothing checked.
    Skipped,
    Healthy,
    /// Active probe failed but the threshold has not been reached.
    Degraded { failures: u32 },
    /// A reconnect was initiated.
    Reconnecting(HealthFailure),
    /// The state moved on while checking; remediation abandoned.
    Abandoned(HealthFailure),
}

// ============================================================================
// HealthMonitor
// ============================================================================

/// Bookkeeping across checks for one connection.
#[derive(Debug)]
pub struct HealthMonitor {
    failure_threshold: u32,
    active_interval: Duration,
    failures: u32,
    last_active: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(failure_threshold: u32, active_interval: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            active_interval,
            failures: 0,
            last_active: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Forget everything, used when the client changes.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.last_active = None;
    }

    pub fn evaluate(&self, sample: &HealthSample) -> PassiveVerdict {
        if !sample.ready {
            PassiveVerdict::NotReady
        } else if !is_valid_latency(sample.latency_seconds) {
            PassiveVerdict::UnstableLatency
        } else {
            PassiveVerdict::Healthy
        }
    }

    pub fn active_due(&self, now: Instant) -> bool {
        self.last_active
            .is_none_or(|last| now.saturating_duration_since(last) >= self.active_interval)
    }

    pub fn record_active(&mut self, ok: bool, now: Instant) -> ActiveVerdict {
        self.last_active = Some(now);
        if ok {
            self.failures = 0;
            return ActiveVerdict::Healthy;
        }
        self.failures += 1;
        if self.failures >= self.failure_threshold {
            self.failures = 0;
            ActiveVerdict::ThresholdReached
        } else {
            ActiveVerdict::Failing {
                failures: self.failures,
            }
        }
    }
}

// ============================================================================
// Checks
// ============================================================================

async fn probe(client: &dyn GatewayClient) -> Option<HealthSample> {
    if client.is_closed() {
        return None;
    }
    let ready = client.is_ready().await;
    let latency = client.latency().await;
    Some(HealthSample::new(ready, latency))
}

impl Supervisor {
    /// Run one health check against the current client.
    pub async fn check_health(&self, monitor: &mut HealthMonitor) -> HealthOutcome {
        if self.state() != ConnectionState::Connected {
            return HealthOutcome::Skipped;
        }

        let config = &self.inner.config;
        let client = self.client();

        let sample = match tokio::time::timeout(config.passive_probe_timeout, probe(&*client)).await
        {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                warn!("Gateway client reports closed");
                return self.remediate(HealthFailure::Closed).await;
            }
            Err(_) => {
                error!(
                    timeout_secs = config.passive_probe_timeout.as_secs_f64(),
                    "Passive health probe timed out"
                );
                return self.remediate(HealthFailure::ProbeTimeout).await;
            }
        };

        match monitor.evaluate(&sample) {
            PassiveVerdict::Healthy => {}
            PassiveVerdict::NotReady => {
                warn!("Gateway client is not ready");
                return self.remediate(HealthFailure::NotReady).await;
            }
            PassiveVerdict::UnstableLatency => {
                warn!(latency = ?sample.latency_seconds, "Gateway latency is unstable");
                return self.remediate(HealthFailure::UnstableLatency).await;
            }
        }

        let now = Instant::now();
        if !monitor.active_due(now) {
            debug!(latency = ?sample.latency_seconds, "Passive health check passed");
            return HealthOutcome::Healthy;
        }

        let ok = match tokio::time::timeout(config.active_probe_timeout, client.fetch_self()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Active health probe failed");
                false
            }
            Err(_) => {
                warn!(
                    timeout_secs = config.active_probe_timeout.as_secs_f64(),
                    "Active health probe timed out"
                );
                false
            }
        };

        match monitor.record_active(ok, Instant::now()) {
            ActiveVerdict::Healthy => {
                debug!("Active health check passed");
                HealthOutcome::Healthy
            }
            ActiveVerdict::Failing { failures } => {
                warn!(failures, threshold = config.failure_threshold, "Active health check failing");
                HealthOutcome::Degraded { failures }
            }
            ActiveVerdict::ThresholdReached => {
                error!(
                    threshold = config.failure_threshold,
                    "Active health check failure threshold reached"
                );
                self.remediate(HealthFailure::ActiveProbeFailures).await
            }
        }
    }

    async fn remediate(&self, reason: HealthFailure) -> HealthOutcome {
        // Another path may have started reconnecting or shutting down meanwhile.
        if self.state() != ConnectionState::Connected {
            debug!(?reason, state = ?self.state(), "State changed during health check");
            return HealthOutcome::Abandoned(reason);
        }
        info!(?reason, "Health check forcing reconnect");
        self.force_reconnect().await;
        HealthOutcome::Reconnecting(reason)
    }
}

/// Health loop body. Runs until shutdown.
pub(super) async fn run_health_loop(supervisor: Supervisor) {
    let inner = supervisor.inner.clone();
    let period = inner.config.health_check_interval;
    let mut monitor = HealthMonitor::new(inner.config.failure_threshold, inner.config.active_probe_interval);
    let mut generation = supervisor.generation();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(period_secs = period.as_secs(), "Health loop started");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let current = supervisor.generation();
                if current != generation {
                    generation = current;
                    monitor.reset();
                }
                supervisor.check_health(&mut monitor).await;
            }
            _ = inner.shutdown.cancelled() => break,
        }
    }
    debug!("Health loop stopped");
}
