//! Backend nodes and the node registry.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus, CircuitState};
use super::config::NodeConfig;
use super::error::{LoadBalancerError, LoadBalancerResult};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Request statistics for a single node.
#[derive(Debug, Default)]
pub struct NodeStats {
    /// Requests admitted to this node.
    pub total_requests: AtomicU64,
    /// Requests released as successful.
    pub successes: AtomicU64,
    /// Requests reported as failed.
    pub failures: AtomicU64,
}

impl NodeStats {
    /// Record success.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record failure.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests admitted so far.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

/// Fields that may be changed on a registered node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeUpdate {
    /// New routing weight.
    pub weight: Option<u32>,
    /// New CPU utilization (0-100).
    pub cpu_utilization: Option<u8>,
    /// New memory utilization (0-100).
    pub memory_utilization: Option<u8>,
}

impl NodeUpdate {
    /// Update that only changes the weight.
    #[must_use]
    pub fn weight(weight: u32) -> Self {
        Self {
            weight: Some(weight),
            ..Self::default()
        }
    }
}

/// Serializable point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    /// Node id.
    pub id: String,
    /// Host.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Routing weight.
    pub weight: u32,
    /// Last probe verdict.
    pub healthy: bool,
    /// Whether the node is being drained.
    pub draining: bool,
    /// In-flight requests.
    pub connections: u32,
    /// Last probe latency.
    pub response_time_ms: u64,
    /// CPU utilization (0-100).
    pub cpu_utilization: u8,
    /// Memory utilization (0-100).
    pub memory_utilization: u8,
    /// Wall-clock time of the last probe.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Breaker view.
    pub circuit_breaker: CircuitBreakerStatus,
}

/// A single backend node.
#[derive(Debug)]
pub struct Node {
    id: String,
    host: String,
    port: u16,
    weight: AtomicU32,
    healthy: AtomicBool,
    draining: AtomicBool,
    connections: AtomicU32,
    response_time_ms: AtomicU64,
    cpu_utilization: AtomicU8,
    memory_utilization: AtomicU8,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    breaker: CircuitBreaker,
    outcome_lock: Mutex<()>,
    stats: NodeStats,
}

impl Node {
    /// Create a node in its initial state: healthy, no connections, breaker closed.
    #[must_use]
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            id: config.id.clone(),
            host: config.host.clone(),
            port: config.port,
            weight: AtomicU32::new(config.weight),
            healthy: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            connections: AtomicU32::new(0),
            response_time_ms: AtomicU64::new(0),
            cpu_utilization: AtomicU8::new(0),
            memory_utilization: AtomicU8::new(0),
            last_health_check: RwLock::new(None),
            breaker: CircuitBreaker::new(),
            outcome_lock: Mutex::new(()),
            stats: NodeStats::default(),
        }
    }

    /// Node id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Routing weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Last probe verdict.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Whether the node is being drained.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Current in-flight requests.
    #[must_use]
    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::Acquire)
    }

    /// Last probe latency in milliseconds.
    #[must_use]
    pub fn response_time_ms(&self) -> u64 {
        self.response_time_ms.load(Ordering::Relaxed)
    }

    /// CPU utilization (0-100).
    #[must_use]
    pub fn cpu_utilization(&self) -> u8 {
        self.cpu_utilization.load(Ordering::Relaxed)
    }

    /// Memory utilization (0-100).
    #[must_use]
    pub fn memory_utilization(&self) -> u8 {
        self.memory_utilization.load(Ordering::Relaxed)
    }

    /// Wall-clock time of the last probe.
    #[must_use]
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.read()
    }

    /// The node's circuit breaker.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Request statistics.
    #[must_use]
    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Whether selection may choose this node.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.is_healthy() && !self.is_draining() && self.breaker.state() != CircuitState::Open
    }

    /// Lock serializing health and breaker updates for this node.
    pub fn outcome_lock(&self) -> MutexGuard<'_, ()> {
        self.outcome_lock.lock()
    }

    /// Admit a request: increment the connection count.
    pub fn acquire(&self) -> u32 {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release a request: decrement the connection count, floored at zero.
    pub fn release(&self) -> u32 {
        let previous = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Record a successful probe.
    pub fn mark_healthy(&self, response_time: Duration) {
        self.response_time_ms
            .store(response_time.as_millis() as u64, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Release);
        *self.last_health_check.write() = Some(Utc::now());
    }

    /// Record a failed probe.
    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
        *self.last_health_check.write() = Some(Utc::now());
    }

    /// Mark the node as draining. Returns `false` if it already was.
    pub(crate) fn begin_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::AcqRel)
    }

    /// Merge an update. Returns `true` if the weight changed.
    pub fn apply_update(&self, update: &NodeUpdate) -> bool {
        if let Some(cpu) = update.cpu_utilization {
            self.cpu_utilization.store(cpu.min(100), Ordering::Relaxed);
        }
        if let Some(memory) = update.memory_utilization {
            self.memory_utilization
                .store(memory.min(100), Ordering::Relaxed);
        }
        match update.weight {
            Some(weight) => self.weight.swap(weight, Ordering::Relaxed) != weight,
            None => false,
        }
    }

    /// Point-in-time view.
    #[must_use]
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            weight: self.weight(),
            healthy: self.is_healthy(),
            draining: self.is_draining(),
            connections: self.connections(),
            response_time_ms: self.response_time_ms(),
            cpu_utilization: self.cpu_utilization(),
            memory_utilization: self.memory_utilization(),
            last_health_check: self.last_health_check(),
            circuit_breaker: self.breaker.status(),
        }
    }
}

/// The authoritative set of nodes.
///
/// Membership is copy-on-write: readers load an immutable `Vec` without
/// locking, writers serialize on `write_lock` and swap in a new `Vec`.
/// Insertion order is preserved and defines the iteration order used for
/// tie-breaking.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: ArcSwap<Vec<Arc<Node>>>,
    write_lock: Mutex<()>,
}

impl NodeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Register a node.
    pub fn add(&self, node: Node) -> LoadBalancerResult<Arc<Node>> {
        let _guard = self.write_lock.lock();
        let current = self.nodes.load();

        if current.iter().any(|n| n.id() == node.id()) {
            return Err(LoadBalancerError::DuplicateNode(node.id().to_string()));
        }

        let node = Arc::new(node);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&node));
        self.nodes.store(Arc::new(next));

        Ok(node)
    }

    /// Remove a node, returning it.
    pub fn remove(&self, id: &str) -> LoadBalancerResult<Arc<Node>> {
        let _guard = self.write_lock.lock();
        let current = self.nodes.load();

        let Some(index) = current.iter().position(|n| n.id() == id) else {
            return Err(LoadBalancerError::NodeNotFound(id.to_string()));
        };

        let mut next: Vec<Arc<Node>> = current.iter().cloned().collect();
        let removed = next.remove(index);
        self.nodes.store(Arc::new(next));

        Ok(removed)
    }

    /// Get a node by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.load().iter().find(|n| n.id() == id).cloned()
    }

    /// All nodes in registration order.
    #[must_use]
    pub fn all(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.load_full()
    }

    /// Nodes that are healthy, not draining and whose breaker is not open.
    #[must_use]
    pub fn list_healthy(&self) -> Vec<Arc<Node>> {
        self.nodes
            .load()
            .iter()
            .filter(|n| n.is_eligible())
            .cloned()
            .collect()
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.load().is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
