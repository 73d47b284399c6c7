//! Configuration management for the Material Issue Engine
//!
//! Supports hierarchical configuration loading:
//! 1. Default values in code
//! 2. Configuration files (development.toml, production.toml)
//! 3. Environment variable overrides with ISSUE_ prefix

use config::{Environment, File};
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Current environment (development, production)
    pub environment: String,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Approval workflow configuration
    pub workflow: WorkflowConfig,

    /// Log output configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    pub acquire_timeout_secs: u64,

    /// Milliseconds a transaction waits on a row lock before failing (0 = wait forever)
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    /// Attempt automatic approval when a fully mapped request is created
    pub auto_approve: bool,

    /// Decision note stamped on automatically approved requests
    pub auto_approve_note: String,

    /// Cancellation reason used when a rejection carries no note
    pub default_reject_reason: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human readable ones
    pub json: bool,
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> AppResult<Self> {
        let config: Self = Self::layered()
            .and_then(|builder| builder.try_deserialize())
            .map_err(|e| AppError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn layered() -> Result<config::Config, config::ConfigError> {
        let environment =
            std::env::var("ISSUE_ENVIRONMENT").unwrap_or_else(|_| "development".into());

        config::Config::builder()
            // Start with default values
            .set_default("environment", environment.clone())?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.lock_timeout_ms", 10_000)?
            .set_default("workflow.auto_approve", true)?
            .set_default("workflow.auto_approve_note", WorkflowConfig::default().auto_approve_note)?
            .set_default(
                "workflow.default_reject_reason",
                WorkflowConfig::default().default_reject_reason,
            )?
            .set_default("logging.json", false)?
            // Load environment-specific config file
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Override with environment variables (ISSUE_ prefix)
            .add_source(
                Environment::with_prefix("ISSUE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
    }

    /// Reject settings the pool or workflow cannot run with
    pub fn validate(&self) -> AppResult<()> {
        let database = &self.database;
        if database.url.trim().is_empty() {
            return Err(AppError::Configuration("database.url must be set".to_string()));
        }
        if database.max_connections == 0 {
            return Err(AppError::Configuration(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if database.min_connections > database.max_connections {
            return Err(AppError::Configuration(format!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                database.min_connections, database.max_connections
            )));
        }
        if self.workflow.default_reject_reason.trim().is_empty() {
            return Err(AppError::Configuration(
                "workflow.default_reject_reason must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            auto_approve: true,
            auto_approve_note: "Automatically approved: stock available at submission".to_string(),
            default_reject_reason: "Request rejected".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_defaults() {
        let workflow = WorkflowConfig::default();
        assert!(workflow.auto_approve);
        assert!(!workflow.auto_approve_note.is_empty());
    }

    fn config() -> Config {
        Config {
            environment: "test".to_string(),
            database: DatabaseConfig {
                url: "postgres://localhost/issues".to_string(),
                max_connections: 10,
                min_connections: 2,
                acquire_timeout_secs: 30,
                lock_timeout_ms: 10_000,
            },
            workflow: WorkflowConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_validate_pool_bounds() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.database.min_connections = 20;
        let err = bad.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");

        let mut bad = config();
        bad.database.max_connections = 0;
        bad.database.min_connections = 0;
        assert!(matches!(bad.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_validate_requires_database_url() {
        let mut bad = config();
        bad.database.url = "  ".to_string();
        match bad.validate() {
            Err(AppError::Configuration(msg)) => assert!(msg.contains("database.url")),
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }
}
