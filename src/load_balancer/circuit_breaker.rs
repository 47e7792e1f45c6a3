//! Per-node circuit breakers.
//!
//! Each node owns one [`CircuitBreaker`]. The [`CircuitBreakerManager`]
//! holds the shared policy, feeds outcomes into breakers, counts trips and
//! publishes transition events. A [`BreakerMonitorTask`] moves expired open
//! breakers to half-open independently of health check timing.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                              │  ▲
//!     │ 3 successes    reset timeout │  │ any failure
//!     │                              ▼  │
//!     └─────────────────────────── HalfOpen
//! ```

use super::config::CircuitBreakerConfig;
use super::events::{self, EventSink};
use super::node::{Node, NodeRegistry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Consecutive half-open successes required to close a breaker.
pub const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 3;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Node is excluded from selection.
    Open,
    /// Trial traffic is allowed.
    HalfOpen,
}

impl CircuitState {
    /// Stable name of the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome fed into a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Probe or request succeeded.
    Success,
    /// Probe or request failed.
    Failure,
}

/// A state change produced by a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Closed to open. Counts as a trip.
    Opened,
    /// Half-open back to open.
    Reopened,
    /// Open to half-open.
    HalfOpened,
    /// Half-open to closed.
    Closed,
}

impl Transition {
    /// State the breaker is in after this transition.
    #[must_use]
    pub fn target(&self) -> CircuitState {
        match self {
            Self::Opened | Self::Reopened => CircuitState::Open,
            Self::HalfOpened => CircuitState::HalfOpen,
            Self::Closed => CircuitState::Closed,
        }
    }

    fn event_name(&self) -> &'static str {
        match self.target() {
            CircuitState::Open => events::CIRCUIT_BREAKER_OPENED,
            CircuitState::HalfOpen => events::CIRCUIT_BREAKER_HALF_OPEN,
            CircuitState::Closed => events::CIRCUIT_BREAKER_CLOSED,
        }
    }
}

/// Read-only view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStatus {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures while closed.
    pub failure_count: u32,
    /// Successes while half-open.
    pub success_count: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
}

impl BreakerInner {
    fn expire(&mut self, now: Instant) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        match self.next_attempt_time {
            Some(next) if now >= next => {
                self.state = CircuitState::HalfOpen;
                self.success_count = 0;
                Some(Transition::HalfOpened)
            },
            _ => None,
        }
    }
}

/// Circuit breaker state machine for a single node.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                next_attempt_time: None,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether the breaker currently blocks selection.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Snapshot of state and counters.
    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Time of the most recent recorded failure.
    #[must_use]
    pub fn last_failure_time(&self) -> Option<Instant> {
        self.inner.lock().last_failure_time
    }

    /// Earliest time an open breaker may move to half-open.
    #[must_use]
    pub fn next_attempt_time(&self) -> Option<Instant> {
        self.inner.lock().next_attempt_time
    }

    /// Move an expired open breaker to half-open.
    pub fn poll(&self, now: Instant) -> Option<Transition> {
        self.inner.lock().expire(now)
    }

    /// Apply an outcome and return the transitions it caused, in order.
    ///
    /// An expired open breaker is first moved to half-open so that the
    /// outcome counts as a trial.
    pub fn record(
        &self,
        outcome: Outcome,
        config: &CircuitBreakerConfig,
        now: Instant,
    ) -> Vec<Transition> {
        let mut inner = self.inner.lock();
        let mut transitions = Vec::new();

        if let Some(t) = inner.expire(now) {
            transitions.push(t);
        }

        match (inner.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                inner.failure_count = 0;
            },
            (CircuitState::Closed, Outcome::Failure) => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(now);
                if inner.failure_count >= config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.next_attempt_time = Some(now + config.reset_timeout);
                    transitions.push(Transition::Opened);
                }
            },
            (CircuitState::Open, Outcome::Success) => {},
            (CircuitState::Open, Outcome::Failure) => {
                inner.last_failure_time = Some(now);
            },
            (CircuitState::HalfOpen, Outcome::Success) => {
                inner.success_count += 1;
                if inner.success_count >= HALF_OPEN_SUCCESS_THRESHOLD {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt_time = None;
                    transitions.push(Transition::Closed);
                }
            },
            (CircuitState::HalfOpen, Outcome::Failure) => {
                inner.state = CircuitState::Open;
                inner.last_failure_time = Some(now);
                inner.next_attempt_time = Some(now + config.reset_timeout);
                transitions.push(Transition::Reopened);
            },
        }

        transitions
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the shared breaker policy to every node.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    trips: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("config", &self.config)
            .field("trips", &self.trips)
            .finish()
    }
}

impl CircuitBreakerManager {
    /// Create a manager.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            trips: AtomicU64::new(0),
            events,
        }
    }

    /// Breaker policy.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether breakers are active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Cumulative closed-to-open transitions across all nodes.
    #[must_use]
    pub fn total_trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Feed an outcome into a node's breaker.
    ///
    /// Callers that also update node health must hold the node's outcome
    /// lock so the two updates are applied together.
    pub fn record_outcome(&self, node: &Node, outcome: Outcome) -> Vec<Transition> {
        if !self.config.enabled {
            return Vec::new();
        }

        let transitions = node
            .breaker()
            .record(outcome, &self.config, Instant::now());
        for transition in &transitions {
            self.on_transition(node, *transition);
        }
        transitions
    }

    /// Move every expired open breaker to half-open.
    ///
    /// Returns the number of breakers that transitioned.
    pub fn tick(&self, nodes: &[Arc<Node>]) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let now = Instant::now();
        let mut transitioned = 0;
        for node in nodes {
            let _guard = node.outcome_lock();
            if let Some(transition) = node.breaker().poll(now) {
                self.on_transition(node, transition);
                transitioned += 1;
            }
        }
        transitioned
    }

    /// Breaker status per node id.
    #[must_use]
    pub fn status(&self, nodes: &[Arc<Node>]) -> BTreeMap<String, CircuitBreakerStatus> {
        nodes
            .iter()
            .map(|node| (node.id().to_string(), node.breaker().status()))
            .collect()
    }

    /// Number of breakers currently open.
    #[must_use]
    pub fn open_count(&self, nodes: &[Arc<Node>]) -> usize {
        nodes.iter().filter(|n| n.breaker().is_open()).count()
    }

    fn on_transition(&self, node: &Node, transition: Transition) {
        let status = node.breaker().status();
        match transition {
            Transition::Opened => {
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!(
                    node = %node.id(),
                    failures = status.failure_count,
                    threshold = self.config.failure_threshold,
                    "circuit breaker opened"
                );
            },
            Transition::Reopened => {
                warn!(node = %node.id(), "circuit breaker reopened after failed trial");
            },
            Transition::HalfOpened => {
                debug!(node = %node.id(), "circuit breaker half-open");
            },
            Transition::Closed => {
                info!(node = %node.id(), "circuit breaker closed");
            },
        }

        self.events.publish(
            transition.event_name(),
            json!({
                "node_id": node.id(),
                "state": status.state,
                "failure_count": status.failure_count,
                "success_count": status.success_count,
                "reset_timeout_ms": self.config.reset_timeout.as_millis() as u64,
            }),
        );
    }
}

/// Periodic task moving expired open breakers to half-open.
pub struct BreakerMonitorTask {
    manager: Arc<CircuitBreakerManager>,
    registry: Arc<NodeRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl BreakerMonitorTask {
    /// Create a new monitor task.
    #[must_use]
    pub fn new(
        manager: Arc<CircuitBreakerManager>,
        registry: Arc<NodeRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            registry,
            shutdown,
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self) {
        if !self.manager.is_enabled() {
            debug!("Circuit breakers disabled");
            return;
        }

        let period = self.manager.config().monitoring_period;
        debug!(
            period_ms = period.as_millis() as u64,
            "Starting circuit breaker monitor"
        );
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!("Circuit breaker monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let nodes = self.registry.all();
                    let transitioned = self.manager.tick(&nodes);
                    if transitioned > 0 {
                        debug!(transitioned, "Circuit breaker monitor tick");
                    }
                }
            }
        }
    }
}
