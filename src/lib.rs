//! # Intelligent Load Balancer
//!
//! Distributes requests across a pool of backend nodes.
//!
//! ## Features
//!
//! - Six selection strategies, including consistent hashing with virtual nodes
//! - Periodic HTTP health probes
//! - Per-node circuit breakers
//! - Connection draining on node removal
//! - Structured events through a pluggable [`load_balancer::EventSink`]
//!
//! ## Example
//!
//! ```no_run
//! use intelligent_lb::load_balancer::{LoadBalancer, LoadBalancerConfig, NodeConfig, RequestContext};
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let balancer = LoadBalancer::new(LoadBalancerConfig::default())?;
//! balancer.add_node(NodeConfig::new("api-1", "10.0.0.1", 8080))?;
//! balancer.start()?;
//!
//! let context = RequestContext::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
//! let node = balancer.select_node(&context)?;
//! // ... forward the request to node.host():node.port() ...
//! balancer.release_connection(node.id(), &context);
//!
//! balancer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod load_balancer;
