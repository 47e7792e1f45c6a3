//! Configuration validation system.

use super::types::AppConfig;
use std::collections::HashSet;
use std::time::Duration;

/// HTTP methods accepted for health probes.
const PROBE_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "OPTIONS"];

/// A single validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// Error message.
    pub message: String,
    /// Severity level.
    pub severity: ValidationSeverity,
}

impl ValidationError {
    /// Create a new error.
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    /// Create a new warning.
    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }
}

/// Severity of validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Error - configuration is invalid.
    Error,
    /// Warning - configuration may have issues.
    Warning,
}

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    /// Create a new empty (valid) result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error to the result.
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Check if the validation passed (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self
            .errors
            .iter()
            .any(|e| e.severity == ValidationSeverity::Error)
    }

    /// Get all validation issues.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Get only errors (not warnings).
    #[must_use]
    pub fn errors_only(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Error)
            .collect()
    }

    /// Get only warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<&ValidationError> {
        self.errors
            .iter()
            .filter(|e| e.severity == ValidationSeverity::Warning)
            .collect()
    }

    /// Merge another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
    }

    fn require_positive(&mut self, field: &str, value: Duration) {
        if value.is_zero() {
            self.add_error(ValidationError::error(field, "Duration must be greater than 0"));
        }
    }
}

/// Trait for configuration validators.
pub trait Validator: std::fmt::Debug + Send + Sync {
    /// Validate a configuration and return any errors.
    fn validate(&self, config: &AppConfig) -> ValidationResult;
}

/// Built-in validator for basic configuration checks.
#[derive(Debug, Default)]
pub struct BasicValidator;

impl BasicValidator {
    /// Create a new basic validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn validate_nodes(config: &AppConfig, result: &mut ValidationResult) {
        let mut seen_ids = HashSet::new();
        for (index, node) in config.load_balancer.nodes.iter().enumerate() {
            if node.id.is_empty() {
                result.add_error(ValidationError::error(
                    format!("nodes[{index}].id"),
                    "Node id cannot be empty",
                ));
            } else if !seen_ids.insert(node.id.as_str()) {
                result.add_error(ValidationError::error(
                    format!("nodes.{}", node.id),
                    format!("Duplicate node id: {}", node.id),
                ));
            }

            if node.host.is_empty() {
                result.add_error(ValidationError::error(
                    format!("nodes[{index}].host"),
                    "Node host cannot be empty",
                ));
            }

            if node.port == 0 {
                result.add_error(ValidationError::error(
                    format!("nodes[{index}].port"),
                    "Node port cannot be 0",
                ));
            }

            if node.weight == 0 {
                result.add_error(ValidationError::error(
                    format!("nodes[{index}].weight"),
                    "Node weight must be greater than 0",
                ));
            }
        }

        if config.load_balancer.nodes.is_empty() {
            result.add_error(ValidationError::warning(
                "nodes",
                "No nodes configured; every selection will fail until nodes are added",
            ));
        }
    }

    fn validate_health_check(config: &AppConfig, result: &mut ValidationResult) {
        let health = &config.load_balancer.health_check;
        if !health.enabled {
            return;
        }

        result.require_positive("health_check.interval", health.interval);
        result.require_positive("health_check.timeout", health.timeout);

        if !(100..=599).contains(&health.expected_status) {
            result.add_error(ValidationError::error(
                "health_check.expected_status",
                format!("Invalid HTTP status code: {}", health.expected_status),
            ));
        }

        if !PROBE_METHODS.contains(&health.method.as_str()) {
            result.add_error(ValidationError::error(
                "health_check.method",
                format!("Unsupported probe method: {}", health.method),
            ));
        }

        if !health.path.starts_with('/') {
            result.add_error(ValidationError::error(
                "health_check.path",
                "Probe path must start with '/'",
            ));
        }

        let worst_case = health.timeout.saturating_mul(health.retries.saturating_add(1));
        if worst_case > health.interval {
            result.add_error(ValidationError::warning(
                "health_check.timeout",
                "Probe timeout (including retries) exceeds the check interval",
            ));
        }
    }

    fn validate_circuit_breaker(config: &AppConfig, result: &mut ValidationResult) {
        let breaker = &config.load_balancer.circuit_breaker;
        if !breaker.enabled {
            return;
        }

        if breaker.failure_threshold == 0 {
            result.add_error(ValidationError::error(
                "circuit_breaker.failure_threshold",
                "Failure threshold must be greater than 0",
            ));
        }
        result.require_positive("circuit_breaker.reset_timeout", breaker.reset_timeout);
        result.require_positive(
            "circuit_breaker.monitoring_period",
            breaker.monitoring_period,
        );
    }
}

impl Validator for BasicValidator {
    fn validate(&self, config: &AppConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        let lb = &config.load_balancer;

        Self::validate_nodes(config, &mut result);
        Self::validate_health_check(config, &mut result);
        Self::validate_circuit_breaker(config, &mut result);

        if lb.strategy.virtual_node_factor == 0 {
            result.add_error(ValidationError::error(
                "strategy.virtual_node_factor",
                "Virtual node factor must be greater than 0",
            ));
        }

        result.require_positive("metrics.interval", lb.metrics.interval);
        result.require_positive("drain.poll_interval", lb.drain.poll_interval);

        if lb.sticky.enabled {
            result.require_positive("sticky.ttl", lb.sticky.ttl);
        }

        if lb.rate_limit.enabled {
            result.require_positive("rate_limit.window", lb.rate_limit.window);
            if lb.rate_limit.max_requests == 0 {
                result.add_error(ValidationError::error(
                    "rate_limit.max_requests",
                    "Max requests must be greater than 0",
                ));
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::NodeConfig;

    fn config_with_nodes(nodes: Vec<NodeConfig>) -> AppConfig {
        let mut config = AppConfig::default();
        config.load_balancer.nodes = nodes;
        config
    }

    #[test]
    fn test_basic_validator_valid() {
        let config = config_with_nodes(vec![NodeConfig::new("a", "10.0.0.1", 8080)]);
        let result = BasicValidator::new().validate(&config);
        assert!(result.is_valid());
        assert!(result.warnings().is_empty());
    }

    #[test]
    fn test_empty_node_list_is_a_warning() {
        let result = BasicValidator::new().validate(&AppConfig::default());
        assert!(result.is_valid());
        assert_eq!(result.warnings().len(), 1);
    }

    #[test]
    fn test_duplicate_node_ids() {
        let config = config_with_nodes(vec![
            NodeConfig::new("a", "10.0.0.1", 8080),
            NodeConfig::new("a", "10.0.0.2", 8080),
        ]);

        let result = BasicValidator::new().validate(&config);
        assert!(!result.is_valid());
        assert!(result.errors()[0].message.contains("Duplicate"));
    }

    #[test]
    fn test_zero_weight_and_port() {
        let config = config_with_nodes(vec![NodeConfig::new("a", "10.0.0.1", 0).with_weight(0)]);

        let result = BasicValidator::new().validate(&config);
        let fields: Vec<&str> = result
            .errors_only()
            .iter()
            .map(|e| e.field.as_str())
            .collect();
        assert_eq!(fields, vec!["nodes[0].port", "nodes[0].weight"]);
    }

    #[test]
    fn test_health_check_checks() {
        let mut config = config_with_nodes(vec![NodeConfig::new("a", "10.0.0.1", 8080)]);
        config.load_balancer.health_check.expected_status = 42;
        config.load_balancer.health_check.method = "FETCH".to_string();
        config.load_balancer.health_check.path = "health".to_string();

        let result = BasicValidator::new().validate(&config);
        assert_eq!(result.errors_only().len(), 3);
    }

    #[test]
    fn test_timeout_longer_than_interval_warns() {
        let mut config = config_with_nodes(vec![NodeConfig::new("a", "10.0.0.1", 8080)]);
        config.load_balancer.health_check.interval = Duration::from_secs(5);
        config.load_balancer.health_check.timeout = Duration::from_secs(3);
        config.load_balancer.health_check.retries = 1;

        let result = BasicValidator::new().validate(&config);
        assert!(result.is_valid());
        assert_eq!(result.warnings()[0].field, "health_check.timeout");
    }

    #[test]
    fn test_breaker_threshold_zero() {
        let mut config = config_with_nodes(vec![NodeConfig::new("a", "10.0.0.1", 8080)]);
        config.load_balancer.circuit_breaker.failure_threshold = 0;

        assert!(!BasicValidator::new().validate(&config).is_valid());

        config.load_balancer.circuit_breaker.enabled = false;
        assert!(BasicValidator::new().validate(&config).is_valid());
    }

    #[test]
    fn test_rate_limit_checked_only_when_enabled() {
        let mut config = config_with_nodes(vec![NodeConfig::new("a", "10.0.0.1", 8080)]);
        config.load_balancer.rate_limit.max_requests = 0;
        assert!(BasicValidator::new().validate(&config).is_valid());

        config.load_balancer.rate_limit.enabled = true;
        assert!(!BasicValidator::new().validate(&config).is_valid());
    }

    #[test]
    fn test_validation_result_merge() {
        let mut result1 = ValidationResult::new();
        result1.add_error(ValidationError::error("field1", "error1"));

        let mut result2 = ValidationResult::new();
        result2.add_error(ValidationError::warning("field2", "warning1"));

        result1.merge(result2);
        assert_eq!(result1.errors().len(), 2);
    }
}
