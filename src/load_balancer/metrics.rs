//! Metrics aggregation.
//!
//! Request outcomes are counted as they happen; everything else is read from
//! the registry and breaker manager when a snapshot is taken.

use super::affinity::SessionAffinity;
use super::circuit_breaker::CircuitBreakerManager;
use super::events::{self, EventSink};
use super::node::NodeRegistry;
use super::rate_limit::ClientRateLimiter;
use chrono::{DateTime, Utc};
use prometheus_client::metrics::counter::Counter;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Process-wide request counters.
///
/// These outlive node removal, so totals never go backwards.
#[derive(Debug, Default)]
pub struct RequestCounters {
    total: Counter,
    successful: Counter,
    failed: Counter,
}

impl RequestCounters {
    /// Record an admitted request.
    pub fn record_request(&self) {
        self.total.inc();
    }

    /// Record a request released as successful.
    pub fn record_success(&self) {
        self.successful.inc();
    }

    /// Record a request reported as failed.
    pub fn record_failure(&self) {
        self.failed.inc();
    }

    /// Admitted requests.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.get()
    }

    /// Successful requests.
    #[must_use]
    pub fn successful(&self) -> u64 {
        self.successful.get()
    }

    /// Failed requests.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.get()
    }
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadBalancerMetrics {
    /// Requests admitted.
    pub total_requests: u64,
    /// Requests released as successful.
    pub successful_requests: u64,
    /// Requests reported as failed.
    pub failed_requests: u64,
    /// Mean probe latency over healthy nodes.
    pub average_response_time_ms: f64,
    /// Admitted requests per second since the balancer was created.
    pub throughput: f64,
    /// In-flight requests across all nodes.
    pub active_connections: u64,
    /// Nodes whose last probe succeeded.
    pub healthy_nodes: usize,
    /// Nodes whose last probe failed.
    pub unhealthy_nodes: usize,
    /// Breakers currently open.
    pub open_circuit_breakers: usize,
    /// Cumulative closed-to-open transitions.
    pub circuit_breaker_trips: u64,
    /// When the snapshot was taken.
    pub collected_at: DateTime<Utc>,
}

impl LoadBalancerMetrics {
    /// Render in Prometheus text exposition format.
    #[must_use]
    pub fn to_prometheus(&self, prefix: &str) -> String {
        let mut output = String::new();

        let counters = [
            ("requests", "Requests admitted", self.total_requests),
            ("requests_successful", "Requests released as successful", self.successful_requests),
            ("requests_failed", "Requests reported as failed", self.failed_requests),
            ("circuit_breaker_trips", "Circuit breaker trips", self.circuit_breaker_trips),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {prefix}_{name} {help}");
            let _ = writeln!(output, "# TYPE {prefix}_{name} counter");
            let _ = writeln!(output, "{prefix}_{name}_total {value}");
        }

        let gauges = [
            (
                "average_response_time_ms",
                "Mean probe latency of healthy nodes",
                self.average_response_time_ms,
            ),
            ("throughput", "Requests per second since start", self.throughput),
            ("active_connections", "In-flight requests", self.active_connections as f64),
            ("healthy_nodes", "Healthy nodes", self.healthy_nodes as f64),
            ("unhealthy_nodes", "Unhealthy nodes", self.unhealthy_nodes as f64),
            ("open_circuit_breakers", "Open circuit breakers", self.open_circuit_breakers as f64),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(output, "# HELP {prefix}_{name} {help}");
            let _ = writeln!(output, "# TYPE {prefix}_{name} gauge");
            let _ = writeln!(output, "{prefix}_{name} {value}");
        }

        output
    }
}

/// Builds [`LoadBalancerMetrics`] snapshots.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: Arc<RequestCounters>,
    registry: Arc<NodeRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    started: Instant,
}

impl MetricsCollector {
    /// Create a collector; throughput is measured from now.
    #[must_use]
    pub fn new(
        counters: Arc<RequestCounters>,
        registry: Arc<NodeRegistry>,
        breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        Self {
            counters,
            registry,
            breakers,
            started: Instant::now(),
        }
    }

    /// Shared request counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<RequestCounters> {
        &self.counters
    }

    /// Take a snapshot.
    #[must_use]
    pub fn collect(&self) -> LoadBalancerMetrics {
        let nodes = self.registry.all();

        let mut healthy_nodes = 0usize;
        let mut latency_sum = 0u64;
        let mut active_connections = 0u64;
        for node in nodes.iter() {
            active_connections += u64::from(node.connections());
            if node.is_healthy() {
                healthy_nodes += 1;
                latency_sum += node.response_time_ms();
            }
        }

        let average_response_time_ms = if healthy_nodes == 0 {
            0.0
        } else {
            latency_sum as f64 / healthy_nodes as f64
        };

        let total_requests = self.counters.total();
        let elapsed = self.started.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            total_requests as f64 / elapsed
        } else {
            0.0
        };

        LoadBalancerMetrics {
            total_requests,
            successful_requests: self.counters.successful(),
            failed_requests: self.counters.failed(),
            average_response_time_ms,
            throughput,
            active_connections,
            healthy_nodes,
            unhealthy_nodes: nodes.len() - healthy_nodes,
            open_circuit_breakers: self.breakers.open_count(&nodes),
            circuit_breaker_trips: self.breakers.total_trips(),
            collected_at: Utc::now(),
        }
    }
}

/// Periodic task publishing metrics snapshots and expiring stale
/// session and rate-limit entries.
pub struct MetricsTask {
    collector: Arc<MetricsCollector>,
    events: Arc<dyn EventSink>,
    affinity: Option<Arc<SessionAffinity>>,
    rate_limiter: Option<Arc<ClientRateLimiter>>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl MetricsTask {
    /// Create a new metrics task.
    #[must_use]
    pub fn new(
        collector: Arc<MetricsCollector>,
        events: Arc<dyn EventSink>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            collector,
            events,
            affinity: None,
            rate_limiter: None,
            interval,
            shutdown,
        }
    }

    /// Also purge expired session bindings each tick.
    #[must_use]
    pub fn with_affinity(mut self, affinity: Option<Arc<SessionAffinity>>) -> Self {
        self.affinity = affinity;
        self
    }

    /// Also purge expired rate-limit windows each tick.
    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Option<Arc<ClientRateLimiter>>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self) {
        debug!(
            interval_secs = self.interval.as_secs(),
            "Starting metrics task"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the first snapshot
        // covers a full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!("Metrics task shutting down");
                    break;
                }
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    fn tick(&self) {
        let metrics = self.collector.collect();
        match serde_json::to_value(&metrics) {
            Ok(payload) => self.events.publish(events::METRICS_COLLECTED, payload),
            Err(e) => warn!(error = %e, "Failed to serialize metrics"),
        }

        let mut purged = 0;
        if let Some(affinity) = &self.affinity {
            purged += affinity.purge_expired();
        }
        if let Some(limiter) = &self.rate_limiter {
            purged += limiter.purge_expired();
        }

        debug!(
            total_requests = metrics.total_requests,
            healthy_nodes = metrics.healthy_nodes,
            active_connections = metrics.active_connections,
            purged,
            "Metrics collected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::circuit_breaker::Outcome;
    use crate::load_balancer::config::{CircuitBreakerConfig, NodeConfig};
    use crate::load_balancer::events::{ChannelEventSink, NoopEventSink};
    use crate::load_balancer::node::Node;

    fn collector() -> (Arc<NodeRegistry>, Arc<CircuitBreakerManager>, MetricsCollector) {
        let registry = Arc::new(NodeRegistry::new());
        let breakers = Arc::new(CircuitBreakerManager::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
            Arc::new(NoopEventSink),
        ));
        let collector = MetricsCollector::new(
            Arc::new(RequestCounters::default()),
            Arc::clone(&registry),
            Arc::clone(&breakers),
        );
        (registry, breakers, collector)
    }

    #[test]
    fn test_request_counters() {
        let counters = RequestCounters::default();
        counters.record_request();
        counters.record_request();
        counters.record_success();
        counters.record_failure();

        assert_eq!(counters.total(), 2);
        assert_eq!(counters.successful(), 1);
        assert_eq!(counters.failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_aggregates_nodes() {
        let (registry, breakers, collector) = collector();
        let a = registry.add(Node::new(&NodeConfig::new("a", "10.0.0.1", 80))).unwrap();
        let b = registry.add(Node::new(&NodeConfig::new("b", "10.0.0.2", 80))).unwrap();
        let c = registry.add(Node::new(&NodeConfig::new("c", "10.0.0.3", 80))).unwrap();

        a.mark_healthy(Duration::from_millis(10));
        b.mark_healthy(Duration::from_millis(30));
        c.mark_unhealthy();
        breakers.record_outcome(&c, Outcome::Failure);

        a.acquire();
        a.acquire();
        b.acquire();
        for _ in 0..20 {
            collector.counters().record_request();
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        let metrics = collector.collect();

        assert_eq!(metrics.total_requests, 20);
        assert_eq!(metrics.active_connections, 3);
        assert_eq!(metrics.healthy_nodes, 2);
        assert_eq!(metrics.unhealthy_nodes, 1);
        assert_eq!(metrics.open_circuit_breakers, 1);
        assert_eq!(metrics.circuit_breaker_trips, 1);
        assert!((metrics.average_response_time_ms - 20.0).abs() < f64::EPSILON);
        assert!((metrics.throughput - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_empty_registry() {
        let (_, _, collector) = collector();
        let metrics = collector.collect();

        assert_eq!(metrics.healthy_nodes, 0);
        assert_eq!(metrics.average_response_time_ms, 0.0);
    }

    #[test]
    fn test_prometheus_rendering() {
        let (_, _, collector) = collector();
        collector.counters().record_request();

        let output = collector.collect().to_prometheus("lb");
        assert!(output.contains("# TYPE lb_requests counter"));
        assert!(output.contains("lb_requests_total 1"));
        assert!(output.contains("# TYPE lb_healthy_nodes gauge"));
        assert!(output.contains("lb_healthy_nodes 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_publishes_metrics() {
        let (_, _, collector) = collector();
        let sink = ChannelEventSink::new(8);
        let mut rx = sink.subscribe();
        let (tx, shutdown) = watch::channel(false);

        let task = tokio::spawn(
            MetricsTask::new(
                Arc::new(collector),
                Arc::new(sink),
                Duration::from_secs(10),
                shutdown,
            )
            .run(),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, events::METRICS_COLLECTED);
        assert_eq!(event.payload["total_requests"], 0);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
