//! Circuit breaker for upstream protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: upstream assumed down, requests fail fast
//! - Half-Open: a bounded number of probes test whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: lazily, on the first admission check after timeout
//! Half-Open → Closed: consecutive successes >= success_threshold
//! Half-Open → Open: any failure (open timer restarts)
//! ```
//!
//! All bookkeeping sits behind one mutex that is never held across I/O.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerConfig;
use crate::error::MeshError;
use crate::observability::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Gauge encoding used by `mesh_breaker_state`.
    pub fn as_gauge(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub target: String,
    pub state: BreakerState,
    /// Consecutive failures in the current streak.
    pub failure_count: u32,
    /// Consecutive successes in the current streak.
    pub success_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected: u64,
    pub half_open_in_flight: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    in_flight_probes: u32,
    /// Bumped on every transition into Half-Open so stale permits from an
    /// earlier probe window cannot release slots of the current one.
    probe_epoch: u64,
    total_failures: u64,
    total_successes: u64,
    rejected: u64,
}

/// Three-state admission controller for one protected target.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    half_open_requests: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
            half_open_requests: config.half_open_requests.max(1),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                in_flight_probes: 0,
                probe_epoch: 0,
                total_failures: 0,
                total_successes: 0,
                rejected: 0,
            }),
        }
    }

    /// Name of the protected target (service or service@version).
    pub fn target(&self) -> &str {
        &self.target
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Counters are only ever written whole; a poisoned guard is still valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move Open → Half-Open once the timeout has elapsed.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state != BreakerState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if elapsed >= self.timeout {
            inner.state = BreakerState::HalfOpen;
            inner.consecutive_successes = 0;
            inner.in_flight_probes = 0;
            inner.probe_epoch += 1;
            tracing::info!(breaker = %self.target, "Circuit breaker half-open, admitting probes");
            metrics::record_breaker_state(&self.target, BreakerState::HalfOpen);
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.consecutive_successes = 0;
        inner.in_flight_probes = 0;
        tracing::warn!(
            breaker = %self.target,
            consecutive_failures = inner.consecutive_failures,
            "Circuit breaker opened"
        );
        metrics::record_breaker_state(&self.target, BreakerState::Open);
    }

    /// Admission check that reserves a probe slot when Half-Open.
    ///
    /// The returned permit should be resolved with [`BreakerPermit::success`]
    /// or [`BreakerPermit::failure`]; dropping it unresolved only frees the
    /// probe slot.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, MeshError> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());

        let state = inner.state;
        let probe_epoch = match state {
            BreakerState::Closed => None,
            BreakerState::HalfOpen if inner.in_flight_probes < self.half_open_requests => {
                inner.in_flight_probes += 1;
                Some(inner.probe_epoch)
            }
            _ => {
                inner.rejected += 1;
                drop(inner);
                metrics::record_breaker_rejection(&self.target);
                return Err(MeshError::BreakerOpen(self.target.clone()));
            }
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            probe_epoch,
            resolved: false,
        })
    }

    /// True while Open, and while Half-Open with the probe quota exhausted.
    pub fn is_open(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => true,
            BreakerState::HalfOpen => inner.in_flight_probes >= self.half_open_requests,
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn record_success(&self) {
        self.on_success(Outcome::Reported);
    }

    pub fn record_failure(&self) {
        self.on_failure(None);
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        BreakerMetrics {
            target: self.target.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            success_count: inner.consecutive_successes,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            rejected: inner.rejected,
            half_open_in_flight: inner.in_flight_probes,
        }
    }

    fn release_probe(inner: &mut Inner, probe_epoch: Option<u64>) {
        if let Some(epoch) = probe_epoch {
            if inner.state == BreakerState::HalfOpen && inner.probe_epoch == epoch {
                inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
            }
        }
    }

    fn on_success(&self, outcome: Outcome) {
        let mut inner = self.lock();
        let counts_as_probe = match outcome {
            Outcome::Reported => true,
            Outcome::Permit(probe_epoch) => {
                Self::release_probe(&mut inner, probe_epoch);
                probe_epoch == Some(inner.probe_epoch)
            }
        };
        inner.total_successes += 1;
        inner.consecutive_failures = 0;

        // Requests admitted before the trip did not probe the upstream.
        if inner.state == BreakerState::HalfOpen && counts_as_probe {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.success_threshold {
                inner.state = BreakerState::Closed;
                inner.consecutive_successes = 0;
                inner.in_flight_probes = 0;
                inner.opened_at = None;
                tracing::info!(breaker = %self.target, "Circuit breaker closed");
                metrics::record_breaker_state(&self.target, BreakerState::Closed);
            }
        }
    }

    fn on_failure(&self, probe_epoch: Option<u64>) {
        let now = Instant::now();
        let mut inner = self.lock();
        Self::release_probe(&mut inner, probe_epoch);
        inner.total_failures += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                self.trip(&mut inner, now);
            }
            BreakerState::HalfOpen => self.trip(&mut inner, now),
            // Outcomes of requests admitted before the trip land here;
            // they must not extend the open window.
            _ => {}
        }
    }

    fn abandon(&self, probe_epoch: Option<u64>) {
        let mut inner = self.lock();
        Self::release_probe(&mut inner, probe_epoch);
    }
}

/// Source of a success report.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    /// Direct `record_success` call.
    Reported,
    /// Resolved permit, with the probe epoch it was admitted under.
    Permit(Option<u64>),
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe_epoch: Option<u64>,
    resolved: bool,
}

impl BreakerPermit {
    /// True when this admission is a Half-Open probe.
    pub fn is_probe(&self) -> bool {
        self.probe_epoch.is_some()
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(Outcome::Permit(self.probe_epoch));
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.probe_epoch);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.abandon(self.probe_epoch);
        }
    }
}
