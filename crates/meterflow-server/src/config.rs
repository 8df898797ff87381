//! Configuration management

use serde::{Deserialize, Serialize};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default number of refresh requests accepted per day.
pub const DEFAULT_DAILY_REFRESH_QUOTA: u32 = 500;

/// Default graph database HTTP endpoint.
pub const DEFAULT_GRAPH_ENDPOINT: &str = "http://localhost:8182";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
    /// Bearer token expected on refresh requests
    #[serde(skip_serializing)]
    pub api_token: String,
    pub daily_refresh_quota: u32,
    pub graph_endpoint: String,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            host: std::env::var("METERFLOW_HOST").unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
            port: env_or("METERFLOW_PORT", DEFAULT_SERVER_PORT),
            shutdown_timeout_secs: env_or("METERFLOW_SHUTDOWN_TIMEOUT", DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            api_token: std::env::var("REFRESH_API_TOKEN").unwrap_or_default(),
            daily_refresh_quota: env_or("REFRESH_DAILY_QUOTA", DEFAULT_DAILY_REFRESH_QUOTA),
            graph_endpoint: std::env::var("GRAPH_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GRAPH_ENDPOINT.to_string()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.api_token.trim().is_empty() {
            anyhow::bail!("REFRESH_API_TOKEN must be set");
        }

        if self.daily_refresh_quota == 0 {
            anyhow::bail!("Daily refresh quota must be greater than 0");
        }

        if self.graph_endpoint.is_empty() {
            anyhow::bail!("Graph endpoint cannot be empty");
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            api_token: String::new(),
            daily_refresh_quota: DEFAULT_DAILY_REFRESH_QUOTA,
            graph_endpoint: DEFAULT_GRAPH_ENDPOINT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_requires_token() {
        assert!(ServerConfig::default().validate().is_err());

        let config = ServerConfig {
            api_token: "secret".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_quota_is_rejected() {
        let config = ServerConfig {
            api_token: "secret".to_string(),
            daily_refresh_quota: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
