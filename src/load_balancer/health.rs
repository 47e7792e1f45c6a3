//! Health check system for backend nodes.

use super::circuit_breaker::{CircuitBreakerManager, Outcome};
use super::config::HealthCheckConfig;
use super::events::{self, EventSink};
use super::node::{Node, NodeRegistry};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{self, JoinSet};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Future returned by a probe: the response status code, or an error message.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<u16, String>> + Send + 'a>>;

/// Transport used to probe a node.
///
/// Implementations do not enforce the timeout themselves; the checker wraps
/// every attempt in `config.timeout`.
pub trait HealthProbe: Send + Sync {
    /// Probe `node` and return the status code it answered with.
    fn probe<'a>(&'a self, node: &'a Node, config: &'a HealthCheckConfig) -> ProbeFuture<'a>;
}

/// Plain HTTP/1.1 probe over a TCP connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProbe;

impl HttpProbe {
    async fn request(node: &Node, config: &HealthCheckConfig) -> Result<u16, String> {
        let address = format!("{}:{}", node.host(), node.port());
        let mut stream = TcpStream::connect(&address)
            .await
            .map_err(|e| format!("connection failed: {e}"))?;

        let request = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            config.method, config.path, address
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| format!("failed to send request: {e}"))?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader
            .read_line(&mut status_line)
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        let mut parts = status_line.split_whitespace();
        let (Some(_version), Some(code)) = (parts.next(), parts.next()) else {
            return Err(format!("invalid HTTP response: {}", status_line.trim_end()));
        };

        code.parse()
            .map_err(|_| format!("invalid status code: {code}"))
    }
}

impl HealthProbe for HttpProbe {
    fn probe<'a>(&'a self, node: &'a Node, config: &'a HealthCheckConfig) -> ProbeFuture<'a> {
        Box::pin(Self::request(node, config))
    }
}

/// Result of one health check.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Node id.
    pub node_id: String,
    /// Verdict.
    pub healthy: bool,
    /// Latency of the successful attempt, or of the whole check on failure.
    pub response_time: Duration,
    /// Last status code received, if any.
    pub status: Option<u16>,
    /// Error message if unhealthy.
    pub error: Option<String>,
    /// Attempts made.
    pub attempts: u32,
}

/// Health check executor.
pub struct HealthChecker {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    breakers: Arc<CircuitBreakerManager>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    /// Create a new health checker.
    #[must_use]
    pub fn new(
        config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
        breakers: Arc<CircuitBreakerManager>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            probe,
            breakers,
            events,
        }
    }

    /// Check if health checks are enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get the check interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Check one node and apply the verdict to its health flag and breaker.
    pub async fn check(&self, node: &Node) -> HealthCheckResult {
        let started = Instant::now();
        let max_attempts = self.config.retries.saturating_add(1);
        let mut status = None;
        let mut error = String::new();

        for attempt in 1..=max_attempts {
            let attempt_started = Instant::now();
            let outcome = timeout(self.config.timeout, self.probe.probe(node, &self.config)).await;

            match outcome {
                Ok(Ok(code)) if code == self.config.expected_status => {
                    let response_time = attempt_started.elapsed();
                    self.apply(node, Outcome::Success, response_time);
                    debug!(
                        node = %node.id(),
                        response_time_ms = response_time.as_millis() as u64,
                        attempt,
                        "Health check passed"
                    );
                    self.events.publish(
                        events::HEALTH_CHECK_COMPLETED,
                        json!({
                            "node_id": node.id(),
                            "response_time_ms": response_time.as_millis() as u64,
                            "status": code,
                        }),
                    );
                    return HealthCheckResult {
                        node_id: node.id().to_string(),
                        healthy: true,
                        response_time,
                        status: Some(code),
                        error: None,
                        attempts: attempt,
                    };
                },
                Ok(Ok(code)) => {
                    status = Some(code);
                    error = format!(
                        "unexpected status code: {code}, expected {}",
                        self.config.expected_status
                    );
                },
                Ok(Err(e)) => error = e,
                Err(_) => error = "probe timeout".to_string(),
            }

            if attempt < max_attempts {
                debug!(
                    node = %node.id(),
                    attempt,
                    error = %error,
                    "Health check attempt failed, retrying"
                );
            }
        }

        self.apply(node, Outcome::Failure, Duration::ZERO);
        warn!(
            node = %node.id(),
            error = %error,
            attempts = max_attempts,
            "Health check failed"
        );
        self.events.publish(
            events::HEALTH_CHECK_FAILED,
            json!({
                "node_id": node.id(),
                "error": error,
                "status": status,
                "attempts": max_attempts,
            }),
        );

        HealthCheckResult {
            node_id: node.id().to_string(),
            healthy: false,
            response_time: started.elapsed(),
            status,
            error: Some(error),
            attempts: max_attempts,
        }
    }

    /// Check every node concurrently, one task per node.
    pub async fn check_all(self: &Arc<Self>, nodes: &[Arc<Node>]) -> Vec<HealthCheckResult> {
        let mut set = Self::spawn_checks(self, nodes);
        let mut results = Vec::with_capacity(nodes.len());

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Health check task failed"),
            }
        }

        results
    }

    fn spawn_checks(self: &Arc<Self>, nodes: &[Arc<Node>]) -> JoinSet<HealthCheckResult> {
        let mut set = JoinSet::new();
        for node in nodes {
            let checker = Arc::clone(self);
            let node = Arc::clone(node);
            set.spawn(async move { checker.check(&node).await });
        }
        set
    }

    fn apply(&self, node: &Node, outcome: Outcome, response_time: Duration) {
        let _guard = node.outcome_lock();
        let was_healthy = node.is_healthy();

        match outcome {
            Outcome::Success => node.mark_healthy(response_time),
            Outcome::Failure => node.mark_unhealthy(),
        }
        self.breakers.record_outcome(node, outcome);

        match (was_healthy, node.is_healthy()) {
            (true, false) => info!(node = %node.id(), "Node marked unhealthy"),
            (false, true) => info!(node = %node.id(), "Node recovered"),
            _ => {},
        }
    }
}

/// Health check task that runs periodically.
#[derive(Debug)]
pub struct HealthCheckTask {
    checker: Arc<HealthChecker>,
    registry: Arc<NodeRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl HealthCheckTask {
    /// Create a new health check task.
    #[must_use]
    pub fn new(
        checker: Arc<HealthChecker>,
        registry: Arc<NodeRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            checker,
            registry,
            shutdown,
        }
    }

    /// Run the health check task until shutdown is signalled.
    ///
    /// Every tick starts a check for each registered node. A node whose
    /// previous check is still running is skipped for that tick, so a slow
    /// probe never holds back the other nodes.
    pub async fn run(mut self) {
        if !self.checker.is_enabled() {
            debug!("Health checks disabled");
            return;
        }

        let interval = self.checker.interval();
        debug!(
            interval_secs = interval.as_secs(),
            "Starting health check task"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut checks: JoinSet<HealthCheckResult> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, String> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    checks.abort_all();
                    debug!(in_flight = in_flight.len(), "Health check task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let nodes = self.registry.all();
                    let mut started = 0usize;
                    for node in nodes.iter() {
                        if in_flight.values().any(|id| id == node.id()) {
                            debug!(node = %node.id(), "Previous health check still running");
                            continue;
                        }
                        let checker = Arc::clone(&self.checker);
                        let node = Arc::clone(node);
                        let node_id = node.id().to_string();
                        let handle = checks.spawn(async move { checker.check(&node).await });
                        in_flight.insert(handle.id(), node_id);
                        started += 1;
                    }
                    debug!(started, total = nodes.len(), "Health check tick");
                }
                Some(joined) = checks.join_next_with_id(), if !checks.is_empty() => {
                    match joined {
                        Ok((task_id, result)) => {
                            in_flight.remove(&task_id);
                            debug!(
                                node = %result.node_id,
                                healthy = result.healthy,
                                "Health check finished"
                            );
                        },
                        Err(e) => {
                            in_flight.remove(&e.id());
                            warn!(error = %e, "Health check task failed");
                        },
                    }
                }
            }
        }
    }
}
