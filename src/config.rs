//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding settings
//! - SQLite database path
//! - Token supply parameters
//! - Payment gateway endpoints
//!
//! Secrets (gateway API key, IPN secret) come from environment variables
//! only and never from the config file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub token: TokenConfig,
    pub gateway: GatewayConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "dialfi.db".to_string(),
        }
    }
}

/// Token supply parameters for the primary token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub total_supply: f64,
}

/// Payment gateway configuration (NOWPayments-compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    /// Public URL the gateway posts status notifications to.
    pub callback_url: String,
}

impl Config {
    /// Load from config.toml or use defaults
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            // Use embedded default config
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    /// Database path (DIALFI_DB env var takes precedence)
    pub fn database_path(&self) -> String {
        match std::env::var("DIALFI_DB") {
            Ok(p) if !p.is_empty() => p,
            _ => self.database.path.clone(),
        }
    }

    /// Gateway API key from the environment, if configured
    pub fn gateway_api_key(&self) -> Option<String> {
        std::env::var("NOWPAYMENTS_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
    }

    /// Shared IPN secret used to verify webhook signatures
    pub fn ipn_secret(&self) -> Option<String> {
        std::env::var("NOWPAYMENTS_IPN_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        // The embedded default config is validated at compile time,
        // so this should never fail. Using a fallback for robustness.
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig::default(),
            token: TokenConfig {
                symbol: "DiFi".to_string(),
                total_supply: 100_000_000.0,
            },
            gateway: GatewayConfig {
                base_url: "https://api.nowpayments.io/v1".to_string(),
                callback_url: "http://localhost:8080/api/airdrop/webhook/nowpayments"
                    .to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config = Config::default();
        assert_eq!(config.token.symbol, "DiFi");
        assert_eq!(config.token.total_supply, 100_000_000.0);
        assert_eq!(config.server.port, 8080);
    }
}
