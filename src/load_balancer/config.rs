//! Load balancer configuration types.

use super::error::{LoadBalancerError, LoadBalancerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of ring entries per unit of node weight.
pub const DEFAULT_VIRTUAL_NODE_FACTOR: u32 = 100;

/// Configuration for the load balancer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Nodes registered at construction time.
    pub nodes: Vec<NodeConfig>,

    /// Active selection strategy.
    pub strategy: LoadBalancingStrategy,

    /// Health check settings shared by all nodes.
    pub health_check: HealthCheckConfig,

    /// Circuit breaker settings shared by all nodes.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Metrics aggregation settings.
    pub metrics: MetricsConfig,

    /// Connection draining on node removal.
    pub drain: DrainConfig,

    /// Session affinity.
    pub sticky: StickyConfig,

    /// Per-client request limiting.
    pub rate_limit: RateLimitConfig,
}

impl LoadBalancerConfig {
    /// Reject settings the background tasks cannot run with.
    ///
    /// Only hard failures are checked here; `config::BasicValidator` covers
    /// the full rule set for configuration files.
    pub fn validate(&self) -> LoadBalancerResult<()> {
        for node in &self.nodes {
            node.validate()?;
        }

        if self.health_check.enabled {
            require_positive("health_check.interval", self.health_check.interval)?;
            require_positive("health_check.timeout", self.health_check.timeout)?;
        }
        if self.circuit_breaker.enabled {
            require_positive(
                "circuit_breaker.monitoring_period",
                self.circuit_breaker.monitoring_period,
            )?;
            if self.circuit_breaker.failure_threshold == 0 {
                return Err(LoadBalancerError::InvalidConfig(
                    "circuit_breaker.failure_threshold must be at least 1".to_string(),
                ));
            }
        }
        require_positive("metrics.interval", self.metrics.interval)?;
        require_positive("drain.poll_interval", self.drain.poll_interval)?;
        if self.rate_limit.enabled {
            require_positive("rate_limit.window", self.rate_limit.window)?;
        }
        Ok(())
    }
}

fn require_positive(field: &str, value: Duration) -> LoadBalancerResult<()> {
    if value.is_zero() {
        return Err(LoadBalancerError::InvalidConfig(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}

/// Configuration for a single backend node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub id: String,

    /// Host name or IP address.
    pub host: String,

    /// Port.
    pub port: u16,

    /// Routing weight (for weighted strategies).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl NodeConfig {
    /// Create a node configuration with weight 1.
    #[must_use]
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: default_weight(),
        }
    }

    /// Set the routing weight.
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Reject an empty id or a zero weight.
    pub fn validate(&self) -> LoadBalancerResult<()> {
        if self.id.is_empty() {
            return Err(LoadBalancerError::InvalidConfig(
                "node id must not be empty".to_string(),
            ));
        }
        if self.weight == 0 {
            return Err(LoadBalancerError::InvalidConfig(format!(
                "node '{}' weight must be at least 1",
                self.id
            )));
        }
        Ok(())
    }
}

/// Load balancing algorithm tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    /// Shared counter modulo set size.
    #[default]
    RoundRobin,
    /// Random draw proportional to weight.
    WeightedRoundRobin,
    /// Fewest in-flight connections.
    LeastConnections,
    /// Lowest last probe latency.
    LeastResponseTime,
    /// Hash of the partition key modulo set size.
    IpHash,
    /// Hash ring with virtual nodes.
    ConsistentHash,
}

impl StrategyType {
    /// Stable name of the algorithm.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
            Self::LeastResponseTime => "least_response_time",
            Self::IpHash => "ip_hash",
            Self::ConsistentHash => "consistent_hash",
        }
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key used by the hash-based strategies to partition requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKey {
    /// Hash by client IP.
    #[default]
    ClientIp,
    /// Hash by session id, falling back to the client IP.
    SessionId,
    /// Hash by a request header, falling back to the client IP.
    Header(String),
}

/// Active algorithm plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingStrategy {
    /// Algorithm tag.
    pub algorithm: StrategyType,

    /// Ring entries per unit of weight (consistent hash only).
    pub virtual_node_factor: u32,

    /// Partition key (hash strategies only).
    pub hash_key: HashKey,
}

impl LoadBalancingStrategy {
    /// Strategy with default parameters.
    #[must_use]
    pub fn new(algorithm: StrategyType) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    /// Set the partition key.
    #[must_use]
    pub fn with_hash_key(mut self, hash_key: HashKey) -> Self {
        self.hash_key = hash_key;
        self
    }

    /// Set the virtual node factor.
    #[must_use]
    pub fn with_virtual_node_factor(mut self, factor: u32) -> Self {
        self.virtual_node_factor = factor;
        self
    }

    /// Whether this strategy uses the hash ring.
    #[must_use]
    pub fn uses_ring(&self) -> bool {
        self.algorithm == StrategyType::ConsistentHash
    }
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        Self {
            algorithm: StrategyType::default(),
            virtual_node_factor: DEFAULT_VIRTUAL_NODE_FACTOR,
            hash_key: HashKey::default(),
        }
    }
}

impl From<StrategyType> for LoadBalancingStrategy {
    fn from(algorithm: StrategyType) -> Self {
        Self::new(algorithm)
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable health checks.
    pub enabled: bool,

    /// Health check interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for a single probe attempt.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra attempts within one check before declaring failure.
    pub retries: u32,

    /// Probe path.
    pub path: String,

    /// Probe HTTP method.
    pub method: String,

    /// Status code that counts as healthy.
    pub expected_status: u16,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 0,
            path: "/health".to_string(),
            method: "GET".to_string(),
            expected_status: 200,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breakers.
    pub enabled: bool,

    /// Consecutive failures before opening.
    pub failure_threshold: u32,

    /// Time spent open before a trial.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,

    /// Cadence of the open-breaker monitor.
    #[serde(with = "humantime_serde")]
    pub monitoring_period: Duration,

    /// Feed failures reported by callers into the breaker.
    pub track_request_outcomes: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(10),
            track_request_outcomes: false,
        }
    }
}

/// Metrics aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Collection interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Connection draining configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Delay between connection count polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Polls before the node is evicted anyway.
    pub max_attempts: u32,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_attempts: 30,
        }
    }
}

/// Sticky session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StickyConfig {
    /// Enable sticky sessions.
    pub enabled: bool,

    /// Sticky session TTL.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Fixed-window per-client rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable limiting.
    pub enabled: bool,

    /// Window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Requests allowed per client per window.
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: Duration::from_secs(60),
            max_requests: 1000,
        }
    }
}

fn default_weight() -> u32 {
    1
}
