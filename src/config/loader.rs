//! Configuration file loader.

use super::error::{ConfigError, ConfigResult};
use super::types::AppConfig;
use super::validation::Validator;
use std::path::Path;
use tracing::warn;

/// Configuration loader with validation support.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Validators to run on loaded configuration.
    validators: Vec<Box<dyn Validator>>,
}

impl ConfigLoader {
    /// Create a new configuration loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validator to the loader.
    #[must_use]
    pub fn with_validator<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist
    /// - The file cannot be read
    /// - The TOML is malformed
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(&self, path: P) -> ConfigResult<AppConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        self.load_str(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or validation fails.
    pub fn load_str(&self, content: &str) -> ConfigResult<AppConfig> {
        let config: AppConfig = toml::from_str(content)?;
        self.validate(&config)?;
        Ok(config)
    }

    /// Validate a configuration against all registered validators.
    ///
    /// Warnings are logged; errors fail validation.
    pub fn validate(&self, config: &AppConfig) -> ConfigResult<()> {
        for validator in &self.validators {
            let result = validator.validate(config);
            for warning in result.warnings() {
                warn!(field = %warning.field, "{}", warning.message);
            }
            if !result.is_valid() {
                let errors: Vec<String> = result
                    .errors_only()
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect();
                return Err(ConfigError::ValidationError(errors.join("; ")));
            }
        }
        Ok(())
    }

    /// Load configuration or return default if file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(&self, path: P) -> ConfigResult<AppConfig> {
        let path = path.as_ref();
        if path.exists() {
            self.load(path)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Save configuration to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn save<P: AsRef<Path>>(&self, config: &AppConfig, path: P) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(config)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BasicValidator;
    use crate::load_balancer::{NodeConfig, StrategyType};
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_load_from_string() {
        let loader = ConfigLoader::new();
        let config = loader
            .load_str(
                r#"
            [strategy]
            algorithm = "weighted_round_robin"

            [[nodes]]
            id = "a"
            host = "10.0.0.1"
            port = 8080
            weight = 3
        "#,
            )
            .unwrap();
        assert_eq!(
            config.load_balancer.strategy.algorithm,
            StrategyType::WeightedRoundRobin
        );
        assert_eq!(config.load_balancer.nodes[0].weight, 3);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        std::fs::write(
            &config_path,
            r#"
            [health_check]
            interval = "15s"
            timeout = "1s"
        "#,
        )
        .unwrap();

        let loader = ConfigLoader::new();
        let config = loader.load(&config_path).unwrap();
        assert_eq!(
            config.load_balancer.health_check.interval,
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_load_nonexistent_file() {
        let loader = ConfigLoader::new();
        let result = loader.load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_or_default() {
        let loader = ConfigLoader::new();
        let config = loader.load_or_default("/nonexistent/path").unwrap();
        assert!(config.load_balancer.nodes.is_empty());
    }

    #[test]
    fn test_malformed_toml() {
        let result = ConfigLoader::new().load_str("[strategy\nalgorithm = 1");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation_failure() {
        let loader = ConfigLoader::new().with_validator(BasicValidator::new());
        let result = loader.load_str(
            r#"
            [[nodes]]
            id = "a"
            host = "10.0.0.1"
            port = 8080
            weight = 0
        "#,
        );

        match result {
            Err(ConfigError::ValidationError(message)) => {
                assert!(message.contains("nodes[0].weight"));
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("saved.toml");

        let mut config = AppConfig::default();
        config
            .load_balancer
            .nodes
            .push(NodeConfig::new("saved", "10.0.0.5", 9090).with_weight(2));
        config.load_balancer.circuit_breaker.reset_timeout = Duration::from_secs(45);

        let loader = ConfigLoader::new();
        loader.save(&config, &config_path).unwrap();

        let loaded = loader.load(&config_path).unwrap();
        assert_eq!(loaded.load_balancer.nodes, config.load_balancer.nodes);
        assert_eq!(
            loaded.load_balancer.circuit_breaker.reset_timeout,
            Duration::from_secs(45)
        );
    }
}
