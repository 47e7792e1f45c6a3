//! # Configuration System
//!
//! TOML-based configuration for the `intelligent-lb` runner: parsing,
//! validation and saving.
//!
//! ## Example Configuration
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [strategy]
//! algorithm = "consistent_hash"
//! virtual_node_factor = 100
//!
//! [health_check]
//! interval = "30s"
//! timeout = "5s"
//! path = "/health"
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! reset_timeout = "60s"
//!
//! [[nodes]]
//! id = "api-1"
//! host = "10.0.0.1"
//! port = 8080
//! weight = 2
//! ```

mod error;
mod loader;
mod types;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use types::{AppConfig, LogFormat, LogLevel, LoggingConfig};
pub use validation::{
    BasicValidator, ValidationError, ValidationResult, ValidationSeverity, Validator,
};
