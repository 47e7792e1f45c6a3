//! Load balancer error types.

use thiserror::Error;

/// Errors that can occur in the load balancer.
#[derive(Debug, Error)]
pub enum LoadBalancerError {
    /// No node is currently eligible for selection.
    #[error("no healthy nodes available")]
    NoHealthyNodes,

    /// A node with this id is already registered.
    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    /// Node not found.
    #[error("node '{0}' not found")]
    NodeNotFound(String),

    /// The client exceeded its request window.
    #[error("client '{0}' exceeded its request limit")]
    RateLimited(String),

    /// Configuration or node settings the balancer cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Background tasks are already running.
    #[error("load balancer already running")]
    AlreadyRunning,

    /// Background tasks are not running.
    #[error("load balancer not running")]
    NotRunning,
}

/// Result type for load balancer operations.
pub type LoadBalancerResult<T> = Result<T, LoadBalancerError>;
