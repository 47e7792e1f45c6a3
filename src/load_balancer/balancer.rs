//! The load balancer facade.

use super::affinity::SessionAffinity;
use super::circuit_breaker::{
    BreakerMonitorTask, CircuitBreakerManager, CircuitBreakerStatus, Outcome,
};
use super::config::{LoadBalancerConfig, LoadBalancingStrategy, NodeConfig};
use super::error::{LoadBalancerError, LoadBalancerResult};
use super::events::{self, EventSink, TracingEventSink};
use super::health::{HealthCheckResult, HealthCheckTask, HealthChecker, HealthProbe, HttpProbe};
use super::metrics::{LoadBalancerMetrics, MetricsCollector, MetricsTask, RequestCounters};
use super::node::{Node, NodeRegistry, NodeSnapshot, NodeUpdate};
use super::rate_limit::ClientRateLimiter;
use super::ring::ConsistentHashRing;
use super::strategy::{RequestContext, SelectionEngine};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Selection statistics.
#[derive(Debug, Default)]
pub struct LoadBalancerStats {
    /// Total selections attempted.
    pub total_selections: AtomicU64,
    /// Selections that returned a node.
    pub successful_selections: AtomicU64,
    /// Selections that found no eligible node.
    pub failed_selections: AtomicU64,
    /// Selections refused by the rate limiter.
    pub rate_limited: AtomicU64,
    /// Selections served from a session binding.
    pub sticky_hits: AtomicU64,
}

impl LoadBalancerStats {
    /// Record a selection attempt.
    pub fn record_selection(&self, success: bool) {
        self.total_selections.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_selections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_selections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a rate-limited request.
    pub fn record_rate_limited(&self) {
        self.total_selections.fetch_add(1, Ordering::Relaxed);
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a selection served from a session binding.
    pub fn record_sticky_hit(&self) {
        self.sticky_hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Summary of the balancer's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadBalancerStatus {
    /// Whether background tasks are running.
    pub running: bool,
    /// Active algorithm.
    pub strategy: &'static str,
    /// Registered nodes.
    pub total_nodes: usize,
    /// Nodes selection may choose from.
    pub eligible_nodes: usize,
    /// Nodes being drained.
    pub draining_nodes: usize,
    /// Breakers currently open.
    pub open_circuit_breakers: usize,
}

/// Builder for [`LoadBalancer`].
pub struct LoadBalancerBuilder {
    config: LoadBalancerConfig,
    events: Option<Arc<dyn EventSink>>,
    probe: Option<Arc<dyn HealthProbe>>,
}

impl LoadBalancerBuilder {
    /// Publish events to `sink` instead of the tracing pipeline.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Probe nodes with `probe` instead of plain HTTP.
    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Build the balancer and register the configured nodes.
    pub fn build(self) -> LoadBalancerResult<LoadBalancer> {
        let config = self.config;
        config.validate()?;

        let events = self
            .events
            .unwrap_or_else(|| Arc::new(TracingEventSink) as Arc<dyn EventSink>);
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(HttpProbe) as Arc<dyn HealthProbe>);

        let registry = Arc::new(NodeRegistry::new());
        let ring = Arc::new(ConsistentHashRing::new());
        let breakers = Arc::new(CircuitBreakerManager::new(
            config.circuit_breaker.clone(),
            Arc::clone(&events),
        ));
        let checker = Arc::new(HealthChecker::new(
            config.health_check.clone(),
            probe,
            Arc::clone(&breakers),
            Arc::clone(&events),
        ));
        let collector = Arc::new(MetricsCollector::new(
            Arc::new(RequestCounters::default()),
            Arc::clone(&registry),
            Arc::clone(&breakers),
        ));
        let affinity = config
            .sticky
            .enabled
            .then(|| Arc::new(SessionAffinity::new(config.sticky.ttl)));
        let rate_limiter = config
            .rate_limit
            .enabled
            .then(|| Arc::new(ClientRateLimiter::new(&config.rate_limit)));
        let engine = SelectionEngine::new(config.strategy.clone(), Arc::clone(&ring));
        let (shutdown_tx, _) = watch::channel(false);

        for node_config in &config.nodes {
            registry.add(Node::new(node_config))?;
        }

        let balancer = LoadBalancer {
            config,
            registry,
            ring,
            engine,
            breakers,
            checker,
            collector,
            affinity,
            rate_limiter,
            events,
            stats: LoadBalancerStats::default(),
            ring_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        };
        balancer.rebuild_ring_if_needed();

        info!(
            nodes = balancer.registry.len(),
            strategy = %balancer.engine.name(),
            "Load balancer created"
        );
        Ok(balancer)
    }
}

/// Distributes requests across a pool of nodes.
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    registry: Arc<NodeRegistry>,
    ring: Arc<ConsistentHashRing>,
    engine: SelectionEngine,
    breakers: Arc<CircuitBreakerManager>,
    checker: Arc<HealthChecker>,
    collector: Arc<MetricsCollector>,
    affinity: Option<Arc<SessionAffinity>>,
    rate_limiter: Option<Arc<ClientRateLimiter>>,
    events: Arc<dyn EventSink>,
    stats: LoadBalancerStats,
    ring_lock: Mutex<()>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("stats", &self.stats)
            .field("strategy", &self.engine.name())
            .field("nodes", &self.registry.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl LoadBalancer {
    /// Create a balancer with the default event sink and probe.
    pub fn new(config: LoadBalancerConfig) -> LoadBalancerResult<Self> {
        Self::builder(config).build()
    }

    /// Start building a balancer.
    #[must_use]
    pub fn builder(config: LoadBalancerConfig) -> LoadBalancerBuilder {
        LoadBalancerBuilder {
            config,
            events: None,
            probe: None,
        }
    }

    /// Configuration the balancer was built with.
    #[must_use]
    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    /// Selection statistics.
    #[must_use]
    pub fn stats(&self) -> &LoadBalancerStats {
        &self.stats
    }

    /// Whether background tasks are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the health check, breaker monitor and metrics tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> LoadBalancerResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(LoadBalancerError::AlreadyRunning);
        }

        self.shutdown_tx.send_replace(false);

        let health = HealthCheckTask::new(
            Arc::clone(&self.checker),
            Arc::clone(&self.registry),
            self.shutdown_tx.subscribe(),
        );
        let monitor = BreakerMonitorTask::new(
            Arc::clone(&self.breakers),
            Arc::clone(&self.registry),
            self.shutdown_tx.subscribe(),
        );
        let metrics = MetricsTask::new(
            Arc::clone(&self.collector),
            Arc::clone(&self.events),
            self.config.metrics.interval,
            self.shutdown_tx.subscribe(),
        )
        .with_affinity(self.affinity.clone())
        .with_rate_limiter(self.rate_limiter.clone());

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(health.run()));
        tasks.push(tokio::spawn(monitor.run()));
        tasks.push(tokio::spawn(metrics.run()));

        info!(
            nodes = self.registry.len(),
            strategy = %self.engine.name(),
            "Load balancer started"
        );
        Ok(())
    }

    /// Stop background tasks and wait for them to exit.
    ///
    /// Drains in progress stop waiting and evict their node immediately.
    pub async fn shutdown(&self) -> LoadBalancerResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(LoadBalancerError::NotRunning);
        }

        info!("Shutting down load balancer");
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        info!("Load balancer stopped");
        Ok(())
    }

    /// Register a node.
    ///
    /// While running with health checks enabled, the node is probed
    /// immediately in the background.
    pub fn add_node(&self, config: NodeConfig) -> LoadBalancerResult<Arc<Node>> {
        config.validate()?;
        let node = self.registry.add(Node::new(&config))?;
        self.rebuild_ring_if_needed();

        info!(
            node = %node.id(),
            host = %node.host(),
            port = node.port(),
            weight = node.weight(),
            "Node added"
        );
        self.events.publish(
            events::NODE_ADDED,
            json!({
                "node_id": node.id(),
                "host": node.host(),
                "port": node.port(),
                "weight": node.weight(),
            }),
        );

        if self.is_running() && self.checker.is_enabled() {
            self.spawn_initial_check(&node);
        }

        Ok(node)
    }

    fn spawn_initial_check(&self, node: &Arc<Node>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let checker = Arc::clone(&self.checker);
        let probed = Arc::clone(node);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = handle.spawn(async move {
            tokio::select! {
                _ = checker.check(&probed) => {},
                _ = shutdown.changed() => {
                    debug!(node = %probed.id(), "Initial health check cancelled by shutdown");
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Drain and remove a node.
    ///
    /// The node stops receiving selections at once. Its connection count is
    /// polled every `drain.poll_interval` for up to `drain.max_attempts`
    /// polls; if connections remain after that, or shutdown is signalled,
    /// the node is evicted anyway.
    ///
    /// Returns immediately if the node is already being drained by another
    /// call; that call completes the removal.
    pub async fn remove_node(&self, id: &str) -> LoadBalancerResult<()> {
        let node = self
            .registry
            .get(id)
            .ok_or_else(|| LoadBalancerError::NodeNotFound(id.to_string()))?;

        if !node.begin_drain() {
            debug!(node = %id, "Node already draining");
            return Ok(());
        }
        info!(node = %id, connections = node.connections(), "Draining node");
        self.events.publish(
            events::NODE_DRAINING,
            json!({ "node_id": id, "connections": node.connections() }),
        );

        let drained = self.wait_for_drain(&node).await;
        let remaining = node.connections();
        if !drained {
            warn!(
                node = %id,
                connections = remaining,
                "Drain incomplete, evicting node with active connections"
            );
        }

        self.registry.remove(id)?;
        if let Some(affinity) = &self.affinity {
            affinity.unbind_node(id);
        }
        self.rebuild_ring_if_needed();

        info!(node = %id, forced = !drained, "Node removed");
        self.events.publish(
            events::NODE_REMOVED,
            json!({
                "node_id": id,
                "forced": !drained,
                "remaining_connections": remaining,
            }),
        );
        Ok(())
    }

    async fn wait_for_drain(&self, node: &Node) -> bool {
        let drain = &self.config.drain;
        let mut shutdown = self.shutdown_tx.subscribe();

        for attempt in 0..drain.max_attempts {
            if node.connections() == 0 {
                return true;
            }
            debug!(
                node = %node.id(),
                connections = node.connections(),
                attempt,
                "Waiting for connections to drain"
            );

            tokio::select! {
                _ = tokio::time::sleep(drain.poll_interval) => {},
                _ = shutdown.changed() => {
                    debug!(node = %node.id(), "Drain cancelled by shutdown");
                    return node.connections() == 0;
                }
            }
        }

        node.connections() == 0
    }

    /// Change a node's weight or utilization.
    pub fn update_node(&self, id: &str, update: NodeUpdate) -> LoadBalancerResult<NodeSnapshot> {
        let node = self
            .registry
            .get(id)
            .ok_or_else(|| LoadBalancerError::NodeNotFound(id.to_string()))?;
        if update.weight == Some(0) {
            return Err(LoadBalancerError::InvalidConfig(format!(
                "node '{id}' weight must be at least 1"
            )));
        }

        if node.apply_update(&update) {
            self.rebuild_ring_if_needed();
        }

        let snapshot = node.snapshot();
        debug!(
            node = %id,
            weight = snapshot.weight,
            cpu = snapshot.cpu_utilization,
            memory = snapshot.memory_utilization,
            "Node updated"
        );
        self.events.publish(
            events::NODE_UPDATED,
            json!({
                "node_id": id,
                "weight": snapshot.weight,
                "cpu_utilization": snapshot.cpu_utilization,
                "memory_utilization": snapshot.memory_utilization,
            }),
        );
        Ok(snapshot)
    }

    /// Choose a node for a request and count it as a new connection.
    ///
    /// The caller must hand the connection back with
    /// [`release_connection`](Self::release_connection) or
    /// [`report_failure`](Self::report_failure).
    pub fn select_node(&self, context: &RequestContext) -> LoadBalancerResult<Arc<Node>> {
        if let Some(limiter) = &self.rate_limiter {
            let client = context.client_key();
            let decision = limiter.check(&client);
            if !decision.allowed {
                self.stats.record_rate_limited();
                debug!(client = %client, "Request rate limited");
                self.events.publish(
                    events::RATE_LIMITED,
                    json!({
                        "client": client,
                        "reset_after_ms": decision.reset_after.as_millis() as u64,
                    }),
                );
                return Err(LoadBalancerError::RateLimited(client));
            }
        }

        let eligible = self.registry.list_healthy();
        let selected = if eligible.is_empty() {
            None
        } else {
            self.sticky_node(&eligible, context)
                .or_else(|| self.select_and_bind(&eligible, context))
        };

        let Some(node) = selected else {
            self.stats.record_selection(false);
            warn!(
                client = %context.client_ip,
                nodes = self.registry.len(),
                "No healthy nodes available"
            );
            self.events.publish(
                events::SELECTION_FAILED,
                json!({
                    "client_ip": context.client_ip.to_string(),
                    "strategy": self.engine.name(),
                    "registered_nodes": self.registry.len(),
                }),
            );
            return Err(LoadBalancerError::NoHealthyNodes);
        };

        self.stats.record_selection(true);
        self.collector.counters().record_request();
        debug!(
            node = %node.id(),
            client = %context.client_ip,
            connections = node.connections(),
            "Node selected"
        );
        self.events.publish(
            events::NODE_SELECTED,
            json!({
                "node_id": node.id(),
                "client_ip": context.client_ip.to_string(),
                "strategy": self.engine.name(),
                "connections": node.connections(),
            }),
        );
        Ok(node)
    }

    fn select_and_bind(
        &self,
        eligible: &[Arc<Node>],
        context: &RequestContext,
    ) -> Option<Arc<Node>> {
        let node = self.engine.select(eligible, context)?;
        if let (Some(affinity), Some(session)) = (&self.affinity, &context.session_id) {
            affinity.bind(session, node.id());
        }
        Some(node)
    }

    fn sticky_node(&self, eligible: &[Arc<Node>], context: &RequestContext) -> Option<Arc<Node>> {
        let affinity = self.affinity.as_ref()?;
        let session = context.session_id.as_deref()?;
        let bound = affinity.lookup(session)?;

        let node = eligible.iter().find(|n| n.id() == bound)?;
        node.acquire();
        self.stats.record_sticky_hit();
        Some(Arc::clone(node))
    }

    /// Return a connection and record the request as successful.
    ///
    /// Unknown node ids are ignored.
    pub fn release_connection(&self, node_id: &str, context: &RequestContext) {
        let Some(node) = self.registry.get(node_id) else {
            debug!(node = %node_id, client = %context.client_ip, "Release for unknown node");
            return;
        };

        let connections = node.release();
        node.stats().record_success();
        self.collector.counters().record_success();

        if self.breakers.config().track_request_outcomes {
            let _guard = node.outcome_lock();
            self.breakers.record_outcome(&node, Outcome::Success);
        }

        debug!(node = %node_id, connections, "Connection released");
    }

    /// Return a connection and record the request as failed.
    ///
    /// With `circuit_breaker.track_request_outcomes` enabled the failure
    /// also counts against the node's breaker.
    pub fn report_failure(&self, node_id: &str, context: &RequestContext) {
        let Some(node) = self.registry.get(node_id) else {
            debug!(node = %node_id, client = %context.client_ip, "Failure for unknown node");
            return;
        };

        let connections = node.release();
        node.stats().record_failure();
        self.collector.counters().record_failure();

        if self.breakers.config().track_request_outcomes {
            let _guard = node.outcome_lock();
            self.breakers.record_outcome(&node, Outcome::Failure);
        }

        debug!(node = %node_id, connections, "Request failure reported");
    }

    /// Probe every node once, outside the periodic schedule.
    pub async fn check_health(&self) -> Vec<HealthCheckResult> {
        let nodes = self.registry.all();
        self.checker.check_all(&nodes).await
    }

    /// Current metrics.
    #[must_use]
    pub fn get_metrics(&self) -> LoadBalancerMetrics {
        self.collector.collect()
    }

    /// Breaker status per node id.
    #[must_use]
    pub fn get_circuit_breaker_status(&self) -> BTreeMap<String, CircuitBreakerStatus> {
        self.breakers.status(&self.registry.all())
    }

    /// Replace the selection strategy.
    pub fn update_strategy(&self, strategy: LoadBalancingStrategy) {
        let _guard = self.ring_lock.lock();

        if strategy.uses_ring() {
            self.ring
                .rebuild(&self.registry.all(), strategy.virtual_node_factor);
        }
        let previous = self.engine.replace(strategy.clone());
        if previous.uses_ring() && !strategy.uses_ring() {
            self.ring.clear();
        }

        info!(
            previous = %previous.algorithm,
            current = %strategy.algorithm,
            "Strategy updated"
        );
        self.events.publish(
            events::STRATEGY_UPDATED,
            json!({
                "previous": previous.algorithm,
                "current": strategy.algorithm,
                "virtual_node_factor": strategy.virtual_node_factor,
            }),
        );
    }

    /// Active strategy.
    #[must_use]
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.engine.strategy()
    }

    /// Snapshots of all nodes in registration order.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.registry.all().iter().map(|n| n.snapshot()).collect()
    }

    /// Snapshot of one node.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<NodeSnapshot> {
        self.registry.get(id).map(|n| n.snapshot())
    }

    /// Snapshots of the nodes selection may choose from.
    #[must_use]
    pub fn list_healthy(&self) -> Vec<NodeSnapshot> {
        self.registry
            .list_healthy()
            .iter()
            .map(|n| n.snapshot())
            .collect()
    }

    /// Summary of the balancer's state.
    #[must_use]
    pub fn status(&self) -> LoadBalancerStatus {
        let nodes = self.registry.all();
        LoadBalancerStatus {
            running: self.is_running(),
            strategy: self.engine.name(),
            total_nodes: nodes.len(),
            eligible_nodes: nodes.iter().filter(|n| n.is_eligible()).count(),
            draining_nodes: nodes.iter().filter(|n| n.is_draining()).count(),
            open_circuit_breakers: self.breakers.open_count(&nodes),
        }
    }

    fn rebuild_ring_if_needed(&self) {
        let _guard = self.ring_lock.lock();
        let strategy = self.engine.strategy();
        if strategy.uses_ring() {
            let nodes = self.registry.all();
            self.ring.rebuild(&nodes, strategy.virtual_node_factor);
            debug!(
                nodes = nodes.len(),
                entries = self.ring.load().len(),
                "Hash ring rebuilt"
            );
        }
    }
}
