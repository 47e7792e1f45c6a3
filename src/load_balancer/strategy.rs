//! Load balancing strategies.
//!
//! Strategies only choose among the nodes they are handed; filtering by
//! health, breaker and drain state happens before selection.

use super::config::{HashKey, LoadBalancingStrategy, StrategyType};
use super::node::Node;
use super::ring::{hash_key, ConsistentHashRing};
use arc_swap::ArcSwap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-request identity used by hash strategies and session affinity.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client IP address.
    pub client_ip: IpAddr,
    /// Session id, if the caller tracks one.
    pub session_id: Option<String>,
    /// Opaque request headers.
    pub headers: HashMap<String, String>,
}

impl RequestContext {
    /// Create a context for a client.
    #[must_use]
    pub fn new(client_ip: IpAddr) -> Self {
        Self {
            client_ip,
            session_id: None,
            headers: HashMap::new(),
        }
    }

    /// Set the session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Key identifying the client for limiting and logging.
    #[must_use]
    pub fn client_key(&self) -> String {
        self.client_ip.to_string()
    }

    /// Partition key for hash strategies, falling back to the client IP.
    #[must_use]
    pub fn partition_key(&self, key: &HashKey) -> Cow<'_, str> {
        match key {
            HashKey::ClientIp => Cow::Owned(self.client_ip.to_string()),
            HashKey::SessionId => match &self.session_id {
                Some(session) => Cow::Borrowed(session.as_str()),
                None => Cow::Owned(self.client_ip.to_string()),
            },
            HashKey::Header(name) => match self.headers.get(name) {
                Some(value) => Cow::Borrowed(value.as_str()),
                None => Cow::Owned(self.client_ip.to_string()),
            },
        }
    }
}

/// Trait for load balancing strategies.
pub trait Strategy: Send + Sync {
    /// Choose one of `nodes`. Returns `None` only if `nodes` is empty.
    fn select<'a>(&self, nodes: &'a [Arc<Node>], context: &RequestContext)
        -> Option<&'a Arc<Node>>;

    /// Get the strategy name.
    fn name(&self) -> &'static str;
}

/// Round-robin over a counter shared by all callers.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    current: AtomicUsize,
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobinStrategy {
    fn select<'a>(
        &self,
        nodes: &'a [Arc<Node>],
        _context: &RequestContext,
    ) -> Option<&'a Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }
        let idx = self.current.fetch_add(1, Ordering::Relaxed) % nodes.len();
        nodes.get(idx)
    }

    fn name(&self) -> &'static str {
        StrategyType::RoundRobin.as_str()
    }
}

/// Random draw weighted by node weight.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinStrategy;

impl WeightedRoundRobinStrategy {
    /// Create a new weighted strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Strategy for WeightedRoundRobinStrategy {
    fn select<'a>(
        &self,
        nodes: &'a [Arc<Node>],
        _context: &RequestContext,
    ) -> Option<&'a Arc<Node>> {
        let total_weight: u64 = nodes.iter().map(|n| u64::from(n.weight())).sum();
        if total_weight == 0 {
            return nodes.first();
        }

        let draw = rand::RngExt::random_range(&mut rand::rng(), 0..total_weight);
        let mut accumulated = 0u64;
        for node in nodes {
            accumulated += u64::from(node.weight());
            if draw < accumulated {
                return Some(node);
            }
        }

        nodes.last()
    }

    fn name(&self) -> &'static str {
        StrategyType::WeightedRoundRobin.as_str()
    }
}

/// Fewest in-flight connections; first node wins ties.
#[derive(Debug, Default)]
pub struct LeastConnectionsStrategy;

impl LeastConnectionsStrategy {
    /// Create a new least connections strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Strategy for LeastConnectionsStrategy {
    fn select<'a>(
        &self,
        nodes: &'a [Arc<Node>],
        _context: &RequestContext,
    ) -> Option<&'a Arc<Node>> {
        let mut best: Option<&Arc<Node>> = None;
        let mut min_connections = u32::MAX;

        for node in nodes {
            let connections = node.connections();
            if best.is_none() || connections < min_connections {
                min_connections = connections;
                best = Some(node);
            }
        }

        best
    }

    fn name(&self) -> &'static str {
        StrategyType::LeastConnections.as_str()
    }
}

/// Lowest last probe latency; first node wins ties.
#[derive(Debug, Default)]
pub struct LeastResponseTimeStrategy;

impl LeastResponseTimeStrategy {
    /// Create a new least response time strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Strategy for LeastResponseTimeStrategy {
    fn select<'a>(
        &self,
        nodes: &'a [Arc<Node>],
        _context: &RequestContext,
    ) -> Option<&'a Arc<Node>> {
        let mut best: Option<&Arc<Node>> = None;
        let mut min_latency = u64::MAX;

        for node in nodes {
            let latency = node.response_time_ms();
            if best.is_none() || latency < min_latency {
                min_latency = latency;
                best = Some(node);
            }
        }

        best
    }

    fn name(&self) -> &'static str {
        StrategyType::LeastResponseTime.as_str()
    }
}

/// Hash of the partition key modulo the set size.
///
/// The mapping depends on the position of nodes in the eligible set, so any
/// membership or health change can remap most clients. Use
/// [`ConsistentHashStrategy`] when stability across scaling matters.
#[derive(Debug, Default)]
pub struct IpHashStrategy {
    hash_key: HashKey,
}

impl IpHashStrategy {
    /// Create an IP hash strategy keyed by `hash_key`.
    #[must_use]
    pub fn new(hash_key: HashKey) -> Self {
        Self { hash_key }
    }
}

impl Strategy for IpHashStrategy {
    fn select<'a>(
        &self,
        nodes: &'a [Arc<Node>],
        context: &RequestContext,
    ) -> Option<&'a Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }
        let key = context.partition_key(&self.hash_key);
        let idx = (hash_key(key.as_bytes()) % nodes.len() as u64) as usize;
        nodes.get(idx)
    }

    fn name(&self) -> &'static str {
        StrategyType::IpHash.as_str()
    }
}

/// Lookup on the shared hash ring.
#[derive(Debug)]
pub struct ConsistentHashStrategy {
    ring: Arc<ConsistentHashRing>,
    hash_key: HashKey,
}

impl ConsistentHashStrategy {
    /// Create a strategy reading from `ring`.
    #[must_use]
    pub fn new(ring: Arc<ConsistentHashRing>, hash_key: HashKey) -> Self {
        Self { ring, hash_key }
    }
}

impl Strategy for ConsistentHashStrategy {
    fn select<'a>(
        &self,
        nodes: &'a [Arc<Node>],
        context: &RequestContext,
    ) -> Option<&'a Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }

        let by_id: HashMap<&str, &'a Arc<Node>> = nodes.iter().map(|n| (n.id(), n)).collect();
        let key = context.partition_key(&self.hash_key);
        let ring = self.ring.load();

        match ring.lookup(key.as_bytes(), |id| by_id.contains_key(id)) {
            Some(id) => by_id.get(id).copied(),
            // Ring not built yet or lagging behind membership.
            None => nodes.first(),
        }
    }

    fn name(&self) -> &'static str {
        StrategyType::ConsistentHash.as_str()
    }
}

/// Strategy container for the supported algorithms.
#[derive(Debug)]
pub enum StrategyContainer {
    /// Round-robin distribution.
    RoundRobin(RoundRobinStrategy),
    /// Weighted random distribution.
    WeightedRoundRobin(WeightedRoundRobinStrategy),
    /// Least connections.
    LeastConnections(LeastConnectionsStrategy),
    /// Least response time.
    LeastResponseTime(LeastResponseTimeStrategy),
    /// Modulo hashing.
    IpHash(IpHashStrategy),
    /// Ring hashing.
    ConsistentHash(ConsistentHashStrategy),
}

impl StrategyContainer {
    /// Build the container for a strategy configuration.
    #[must_use]
    pub fn build(strategy: &LoadBalancingStrategy, ring: &Arc<ConsistentHashRing>) -> Self {
        match strategy.algorithm {
            StrategyType::RoundRobin => Self::RoundRobin(RoundRobinStrategy::new()),
            StrategyType::WeightedRoundRobin => {
                Self::WeightedRoundRobin(WeightedRoundRobinStrategy::new())
            },
            StrategyType::LeastConnections => {
                Self::LeastConnections(LeastConnectionsStrategy::new())
            },
            StrategyType::LeastResponseTime => {
                Self::LeastResponseTime(LeastResponseTimeStrategy::new())
            },
            StrategyType::IpHash => Self::IpHash(IpHashStrategy::new(strategy.hash_key.clone())),
            StrategyType::ConsistentHash => Self::ConsistentHash(ConsistentHashStrategy::new(
                Arc::clone(ring),
                strategy.hash_key.clone(),
            )),
        }
    }

    /// Get the strategy as a trait object.
    pub fn as_strategy(&self) -> &dyn Strategy {
        match self {
            Self::RoundRobin(s) => s,
            Self::WeightedRoundRobin(s) => s,
            Self::LeastConnections(s) => s,
            Self::LeastResponseTime(s) => s,
            Self::IpHash(s) => s,
            Self::ConsistentHash(s) => s,
        }
    }

    /// Get strategy name.
    pub fn name(&self) -> &'static str {
        self.as_strategy().name()
    }
}

#[derive(Debug)]
struct ActiveStrategy {
    config: LoadBalancingStrategy,
    container: StrategyContainer,
}

/// Applies the active strategy and admits the chosen node.
#[derive(Debug)]
pub struct SelectionEngine {
    active: ArcSwap<ActiveStrategy>,
    ring: Arc<ConsistentHashRing>,
}

impl SelectionEngine {
    /// Create an engine running `strategy`.
    #[must_use]
    pub fn new(strategy: LoadBalancingStrategy, ring: Arc<ConsistentHashRing>) -> Self {
        let container = StrategyContainer::build(&strategy, &ring);
        Self {
            active: ArcSwap::from_pointee(ActiveStrategy {
                config: strategy,
                container,
            }),
            ring,
        }
    }

    /// Active strategy configuration.
    #[must_use]
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.active.load().config.clone()
    }

    /// Name of the active algorithm.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.active.load().container.name()
    }

    /// Swap in a new strategy, returning the previous one.
    pub fn replace(&self, strategy: LoadBalancingStrategy) -> LoadBalancingStrategy {
        let container = StrategyContainer::build(&strategy, &self.ring);
        let previous = self.active.swap(Arc::new(ActiveStrategy {
            config: strategy,
            container,
        }));
        previous.config.clone()
    }

    /// Choose a node without admitting it.
    #[must_use]
    pub fn choose(&self, nodes: &[Arc<Node>], context: &RequestContext) -> Option<Arc<Node>> {
        let active = self.active.load();
        active
            .container
            .as_strategy()
            .select(nodes, context)
            .cloned()
    }

    /// Choose a node and increment its connection count.
    #[must_use]
    pub fn select(&self, nodes: &[Arc<Node>], context: &RequestContext) -> Option<Arc<Node>> {
        let node = self.choose(nodes, context)?;
        node.acquire();
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::config::NodeConfig;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn make_nodes(count: usize) -> Vec<Arc<Node>> {
        (0..count)
            .map(|i| {
                Arc::new(Node::new(&NodeConfig::new(
                    format!("node-{i}"),
                    format!("10.0.0.{}", i + 1),
                    8080,
                )))
            })
            .collect()
    }

    fn ctx(last_octet: u8) -> RequestContext {
        RequestContext::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet)))
    }

    fn index_of(nodes: &[Arc<Node>], node: &Arc<Node>) -> usize {
        nodes.iter().position(|n| n.id() == node.id()).unwrap()
    }

    #[test]
    fn test_round_robin_is_fair() {
        let strategy = RoundRobinStrategy::new();
        let nodes = make_nodes(3);
        let context = ctx(1);

        let mut counts = [0u32; 3];
        for _ in 0..3_001 {
            let node = strategy.select(&nodes, &context).unwrap();
            counts[index_of(&nodes, node)] += 1;
        }

        assert_eq!(counts.iter().sum::<u32>(), 3_001);
        for count in counts {
            assert!(count == 1_000 || count == 1_001, "counts: {counts:?}");
        }
    }

    #[test]
    fn test_round_robin_counter_is_shared_across_clients() {
        let strategy = RoundRobinStrategy::new();
        let nodes = make_nodes(2);

        let first = strategy.select(&nodes, &ctx(1)).unwrap();
        let second = strategy.select(&nodes, &ctx(2)).unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_empty_set_returns_none() {
        let nodes: Vec<Arc<Node>> = Vec::new();
        let context = ctx(1);

        assert!(RoundRobinStrategy::new().select(&nodes, &context).is_none());
        assert!(WeightedRoundRobinStrategy::new()
            .select(&nodes, &context)
            .is_none());
        assert!(LeastConnectionsStrategy::new()
            .select(&nodes, &context)
            .is_none());
        assert!(LeastResponseTimeStrategy::new()
            .select(&nodes, &context)
            .is_none());
        assert!(IpHashStrategy::default().select(&nodes, &context).is_none());
        assert!(
            ConsistentHashStrategy::new(Arc::new(ConsistentHashRing::new()), HashKey::ClientIp)
                .select(&nodes, &context)
                .is_none()
        );
    }

    #[test]
    fn test_weighted_proportions() {
        let strategy = WeightedRoundRobinStrategy::new();
        let nodes = vec![
            Arc::new(Node::new(&NodeConfig::new("a", "10.0.0.1", 80).with_weight(1))),
            Arc::new(Node::new(&NodeConfig::new("b", "10.0.0.2", 80).with_weight(3))),
        ];
        let context = ctx(1);

        let mut counts = [0u32; 2];
        for _ in 0..4_000 {
            let node = strategy.select(&nodes, &context).unwrap();
            counts[index_of(&nodes, node)] += 1;
        }

        // 5% of the sample around the expected 1000 / 3000 split.
        assert!((800..=1_200).contains(&counts[0]), "counts: {counts:?}");
        assert!((2_800..=3_200).contains(&counts[1]), "counts: {counts:?}");
    }

    #[test]
    fn test_least_connections_picks_minimum_first_found() {
        let strategy = LeastConnectionsStrategy::new();
        let nodes = make_nodes(3);
        let context = ctx(1);

        nodes[0].acquire();
        nodes[0].acquire();
        nodes[1].acquire();

        let selected = strategy.select(&nodes, &context).unwrap();
        assert_eq!(selected.id(), "node-2");

        nodes[2].acquire();
        let selected = strategy.select(&nodes, &context).unwrap();
        assert_eq!(selected.id(), "node-1");
    }

    #[test]
    fn test_least_response_time() {
        let strategy = LeastResponseTimeStrategy::new();
        let nodes = make_nodes(3);
        let context = ctx(1);

        nodes[0].mark_healthy(Duration::from_millis(40));
        nodes[1].mark_healthy(Duration::from_millis(10));
        nodes[2].mark_healthy(Duration::from_millis(10));

        let selected = strategy.select(&nodes, &context).unwrap();
        assert_eq!(selected.id(), "node-1");
    }

    #[test]
    fn test_ip_hash_is_sticky_per_client() {
        let strategy = IpHashStrategy::new(HashKey::ClientIp);
        let nodes = make_nodes(4);

        for octet in 1..50 {
            let context = ctx(octet);
            let first = strategy.select(&nodes, &context).unwrap().id().to_string();
            let second = strategy.select(&nodes, &context).unwrap().id().to_string();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_partition_key_fallbacks() {
        let context = ctx(9).with_session("s-1").with_header("x-tenant", "acme");

        assert_eq!(context.partition_key(&HashKey::ClientIp), "192.168.1.9");
        assert_eq!(context.partition_key(&HashKey::SessionId), "s-1");
        assert_eq!(
            context.partition_key(&HashKey::Header("x-tenant".into())),
            "acme"
        );
        assert_eq!(
            context.partition_key(&HashKey::Header("x-missing".into())),
            "192.168.1.9"
        );
        assert_eq!(ctx(9).partition_key(&HashKey::SessionId), "192.168.1.9");
    }

    #[test]
    fn test_consistent_hash_skips_missing_nodes() {
        let nodes = make_nodes(4);
        let ring = Arc::new(ConsistentHashRing::new());
        ring.rebuild(&nodes, 100);
        let strategy = ConsistentHashStrategy::new(Arc::clone(&ring), HashKey::ClientIp);
        let context = ctx(77);

        let owner = strategy.select(&nodes, &context).unwrap().id().to_string();
        let remaining: Vec<Arc<Node>> = nodes
            .iter()
            .filter(|n| n.id() != owner)
            .cloned()
            .collect();
        let fallback = strategy.select(&remaining, &context).unwrap();
        assert_ne!(fallback.id(), owner);
    }

    #[test]
    fn test_engine_select_admits_node() {
        let ring = Arc::new(ConsistentHashRing::new());
        let engine = SelectionEngine::new(
            LoadBalancingStrategy::new(StrategyType::LeastConnections),
            ring,
        );
        let nodes = make_nodes(2);
        let context = ctx(1);

        let before = nodes[0].connections();
        let node = engine.select(&nodes, &context).unwrap();
        assert_eq!(node.connections(), before + 1);

        let node = engine.select(&nodes, &context).unwrap();
        assert_eq!(node.id(), "node-1");
    }

    #[test]
    fn test_engine_replace() {
        let engine = SelectionEngine::new(
            LoadBalancingStrategy::default(),
            Arc::new(ConsistentHashRing::new()),
        );
        assert_eq!(engine.name(), "round_robin");

        let previous = engine.replace(LoadBalancingStrategy::new(StrategyType::IpHash));
        assert_eq!(previous.algorithm, StrategyType::RoundRobin);
        assert_eq!(engine.name(), "ip_hash");
        assert_eq!(engine.strategy().algorithm, StrategyType::IpHash);
    }

    #[test]
    fn test_container_names() {
        let ring = Arc::new(ConsistentHashRing::new());
        for algorithm in [
            StrategyType::RoundRobin,
            StrategyType::WeightedRoundRobin,
            StrategyType::LeastConnections,
            StrategyType::LeastResponseTime,
            StrategyType::IpHash,
            StrategyType::ConsistentHash,
        ] {
            let container = StrategyContainer::build(&algorithm.into(), &ring);
            assert_eq!(container.name(), algorithm.as_str());
        }
    }
}
