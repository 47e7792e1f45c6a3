//! Event sinks for load balancer observability.
//!
//! The balancer never inspects what a sink does with an event; it only calls
//! [`EventSink::publish`] with a name and a JSON payload.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// A node was registered.
pub const NODE_ADDED: &str = "node_added";
/// A node was removed from the registry.
pub const NODE_REMOVED: &str = "node_removed";
/// A node's mutable fields changed.
pub const NODE_UPDATED: &str = "node_updated";
/// A node stopped accepting new selections ahead of removal.
pub const NODE_DRAINING: &str = "node_draining";
/// A node was chosen for a request.
pub const NODE_SELECTED: &str = "node_selected";
/// No eligible node was available for a request.
pub const SELECTION_FAILED: &str = "selection_failed";
/// A health probe succeeded.
pub const HEALTH_CHECK_COMPLETED: &str = "health_check_completed";
/// A health probe failed.
pub const HEALTH_CHECK_FAILED: &str = "health_check_failed";
/// A breaker moved to open.
pub const CIRCUIT_BREAKER_OPENED: &str = "circuit_breaker_opened";
/// A breaker moved to half-open.
pub const CIRCUIT_BREAKER_HALF_OPEN: &str = "circuit_breaker_half_open";
/// A breaker moved to closed.
pub const CIRCUIT_BREAKER_CLOSED: &str = "circuit_breaker_closed";
/// A periodic metrics snapshot was taken.
pub const METRICS_COLLECTED: &str = "metrics_collected";
/// The active strategy was replaced.
pub const STRATEGY_UPDATED: &str = "strategy_updated";
/// A client was refused by the rate limiter.
pub const RATE_LIMITED: &str = "rate_limited";

/// Write-only destination for balancer events.
pub trait EventSink: Send + Sync {
    /// Publish a named event.
    fn publish(&self, name: &str, payload: Value);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _name: &str, _payload: Value) {}
}

/// Sink that writes every event to the `tracing` pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, name: &str, payload: Value) {
        debug!(event = name, payload = %payload, "load balancer event");
    }
}

/// An event as delivered to channel subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// Structured payload.
    pub payload: Value,
    /// Wall-clock publication time.
    pub timestamp: DateTime<Utc>,
}

/// Sink that fans events out to broadcast subscribers.
///
/// Events published while nobody is subscribed are dropped. Slow
/// subscribers observe `RecvError::Lagged` rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: broadcast::Sender<Event>,
}

impl ChannelEventSink {
    /// Create a sink buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for ChannelEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, name: &str, payload: Value) {
        let _ = self.sender.send(Event {
            name: name.to_string(),
            payload,
            timestamp: Utc::now(),
        });
    }
}
