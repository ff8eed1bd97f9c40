// Configuration types and CLI surface for the payment core.
//
// Layered the way the teacher's storage node does it: a typed `AppConfig`
// loaded via the `config` crate from a TOML file, overridable by environment
// variables under a fixed prefix, plus a `clap`-derived CLI exposing the
// admin surface as subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_path: "./payment_core.sqlite3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub yookassa_shop_id: Option<String>,
    pub yookassa_api_key: Option<String>,
    pub yookassa_webhook_secret: Option<String>,
    pub platega_merchant_id: Option<String>,
    pub platega_secret: Option<String>,
    pub cryptobot_token: Option<String>,
    pub return_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            yookassa_shop_id: None,
            yookassa_api_key: None,
            yookassa_webhook_secret: None,
            platega_merchant_id: None,
            platega_secret: None,
            cryptobot_token: None,
            return_url: "https://example.invalid/return".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VpnConfig {
    pub public_host: String,
    pub primary_outline_server_id: Option<i64>,
    pub per_call_timeout_seconds: u64,
}

impl Default for VpnConfig {
    fn default() -> Self {
        VpnConfig {
            public_host: "vpn.example.invalid".to_string(),
            primary_outline_server_id: None,
            per_call_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub admin_user_id: Option<i64>,
    pub bot_token: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            admin_user_id: None,
            bot_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentTimingConfig {
    pub payment_timeout_minutes: u64,
    pub pending_check_interval_seconds: u64,
    pub reconcile_interval_seconds: u64,
    pub cleanup_expired_hours: i64,
}

impl Default for PaymentTimingConfig {
    fn default() -> Self {
        PaymentTimingConfig {
            payment_timeout_minutes: 5,
            pending_check_interval_seconds: 5,
            reconcile_interval_seconds: 60,
            cleanup_expired_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub providers: ProviderConfig,
    #[serde(default)]
    pub vpn: VpnConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub timing: PaymentTimingConfig,
}

const ENV_PREFIX: &str = "VPN_CORE";

/// Loads `AppConfig` from an optional TOML file, then layers environment
/// variables prefixed `VPN_CORE_` (nested fields separated by `__`, e.g.
/// `VPN_CORE_API__PORT`) on top, the same layering order as the teacher's
/// `load_config`.
pub fn load_config(config_path: Option<&PathBuf>) -> std::result::Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        .add_source(Config::try_from(&AppConfig::default())?);
    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path.clone()));
        }
    }
    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
    builder.build()?.try_deserialize()
}

/// Command-line entry point, mirroring the admin surface in SPEC_FULL.md §6:
/// `reconcile`, `recheck`, `refund`, `retry`, `issue`, plus `serve`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server and the background reconciler loop (default).
    Serve,
    /// Run one reconciliation sweep immediately and exit.
    Reconcile,
    /// Re-check a single payment's status against its provider.
    Recheck { payment_id: String },
    /// Refund a payment.
    Refund {
        payment_id: String,
        #[arg(long, default_value = "requested by admin")]
        reason: String,
    },
    /// Retry subscription provisioning for a stuck payment.
    Retry { payment_id: String },
    /// Force simple-key issuance for a payment.
    Issue { payment_id: String },
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api.port == 0 {
            return Err(crate::error::PaymentCoreError::config("api.port must be nonzero"));
        }
        if self.storage.database_path.is_empty() {
            return Err(crate::error::PaymentCoreError::config("storage.database_path must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = load_config(Some(&PathBuf::from("/nonexistent/path/config.toml"))).unwrap();
        assert_eq!(config.api.port, 8080);
    }
}
