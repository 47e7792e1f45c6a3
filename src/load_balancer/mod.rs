//! # Load Balancer
//!
//! Distributes requests across a pool of backend nodes.
//!
//! ## Features
//!
//! - **Six Strategies**: round-robin, weighted, least-connections,
//!   least-response-time, IP hash and consistent hashing
//! - **Health Checks**: periodic HTTP probes with per-attempt timeouts
//! - **Circuit Breakers**: per-node breakers fed by probe outcomes
//! - **Connection Draining**: removal waits for in-flight requests
//! - **Session Affinity**: optional sticky sessions
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │         LoadBalancer         │
//! │                              │
//! │  ┌───────────┐ ┌──────────┐  │      ┌───────┐
//! │  │ Selection │ │   Hash   │──┼────▶│ Node1 │
//! │  │  Engine   │ │   Ring   │  │      └───────┘
//! │  └───────────┘ └──────────┘  │      ┌───────┐
//! │        │                     │────▶│ Node2 │
//! │  ┌───────────┐ ┌──────────┐  │      └───────┘
//! │  │  Health   │ │ Circuit  │  │      ┌───────┐
//! │  │  Checker  │─│ Breakers │──┼────▶│ Node3 │
//! │  └───────────┘ └──────────┘  │      └───────┘
//! └──────────────────────────────┘
//! ```

pub mod affinity;
pub mod balancer;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod node;
pub mod rate_limit;
pub mod ring;
pub mod strategy;

pub use balancer::{LoadBalancer, LoadBalancerBuilder, LoadBalancerStats, LoadBalancerStatus};
pub use circuit_breaker::{CircuitBreakerStatus, CircuitState};
pub use config::{
    CircuitBreakerConfig, DrainConfig, HashKey, HealthCheckConfig, LoadBalancerConfig,
    LoadBalancingStrategy, MetricsConfig, NodeConfig, RateLimitConfig, StickyConfig,
    StrategyType,
};
pub use error::{LoadBalancerError, LoadBalancerResult};
pub use events::{ChannelEventSink, Event, EventSink, NoopEventSink, TracingEventSink};
pub use health::{HealthCheckResult, HealthProbe, HttpProbe, ProbeFuture};
pub use metrics::LoadBalancerMetrics;
pub use node::{Node, NodeSnapshot, NodeUpdate};
pub use strategy::{RequestContext, Strategy};
