//! Worker configuration.
//!
//! Loaded in priority order, highest first:
//! 1. `MAILHOOK_*` environment variables
//! 2. `mailhook.toml` in the working directory
//! 3. Built-in defaults

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::{client::ClientConfig, telemetry, worker::WorkerConfig};

const CONFIG_FILE: &str = "mailhook.toml";
const ENV_PREFIX: &str = "MAILHOOK_";

/// Complete worker configuration.
///
/// # Example
///
/// ```no_run
/// use mailhook_delivery::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("processing {} jobs at a time", config.concurrency);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Jobs processed concurrently.
    ///
    /// Environment variable: `MAILHOOK_CONCURRENCY`
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Timeout for a single webhook POST in seconds.
    ///
    /// Environment variable: `MAILHOOK_DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_seconds: u64,

    /// User agent sent with every notification.
    ///
    /// Environment variable: `MAILHOOK_USER_AGENT`
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Redirects followed per POST.
    ///
    /// Environment variable: `MAILHOOK_MAX_REDIRECTS`
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// Minimum timeout for calls to the coordinator in milliseconds.
    ///
    /// Environment variable: `MAILHOOK_RPC_TIMEOUT_MS`
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Interval between heartbeat frames in milliseconds.
    ///
    /// Environment variable: `MAILHOOK_HEARTBEAT_INTERVAL_MS`
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Default log filter; `RUST_LOG` takes precedence when set.
    ///
    /// Environment variable: `MAILHOOK_LOG_LEVEL`
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Config {
    /// Loads configuration from defaults, `mailhook.toml` and the
    /// environment, then validates it.
    ///
    /// # Errors
    ///
    /// Returns an error when a source cannot be parsed or a value is out of
    /// range.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// HTTP client settings.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            user_agent: self.user_agent.clone(),
            max_redirects: self.max_redirects,
        }
    }

    /// Worker pool settings.
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig { concurrency: self.concurrency }
    }

    /// Default timeout for coordinator calls.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Heartbeat interval on the coordinator link.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Installs the global subscriber with `log_level` as the default filter.
    ///
    /// # Errors
    ///
    /// Returns an error when a subscriber is already installed.
    pub fn init_tracing(&self) -> Result<()> {
        telemetry::init_tracing(&self.log_level)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }
        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }
        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent cannot be empty");
        }
        if self.rpc_timeout_ms == 0 {
            anyhow::bail!("rpc_timeout_ms must be greater than 0");
        }
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be greater than 0");
        }
        EnvFilter::try_new(&self.log_level)
            .with_context(|| format!("log_level {:?} is not a valid filter", self.log_level))?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            delivery_timeout_seconds: default_delivery_timeout(),
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            rpc_timeout_ms: default_rpc_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            log_level: default_log_level(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_delivery_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    ClientConfig::default().user_agent
}

fn default_max_redirects() -> u32 {
    5
}

fn default_rpc_timeout() -> u64 {
    10_000
}

fn default_heartbeat_interval() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert!(config.user_agent.starts_with("mailhook/"));
    }

    #[test]
    fn file_then_env_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                concurrency = 4
                user_agent = "acme-hooks/2"
                delivery_timeout_seconds = 5
                "#,
            )?;
            jail.set_env("MAILHOOK_CONCURRENCY", "8");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.concurrency, 8);
            assert_eq!(config.user_agent, "acme-hooks/2");
            assert_eq!(config.to_client_config().timeout, Duration::from_secs(5));
            assert_eq!(config.to_worker_config().concurrency, 8);
            assert_eq!(config.max_redirects, 5);
            Ok(())
        });
    }

    #[test]
    fn zero_concurrency_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("MAILHOOK_CONCURRENCY", "0");
            let error = Config::load().unwrap_err();
            assert!(error.to_string().contains("concurrency"));
            Ok(())
        });
    }

    #[test]
    fn validation_catches_bad_values() {
        let config = Config { user_agent: "  ".into(), ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config { heartbeat_interval_ms: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_level_must_parse_as_filter() {
        Jail::expect_with(|jail| {
            jail.set_env("MAILHOOK_LOG_LEVEL", "mailhook=loud");
            let error = Config::load().unwrap_err();
            assert!(format!("{error:#}").contains("log_level"));

            jail.set_env("MAILHOOK_LOG_LEVEL", "warn,mailhook_delivery=debug");
            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.log_level, "warn,mailhook_delivery=debug");
            Ok(())
        });
    }

    #[test]
    fn init_tracing_uses_configured_level() {
        let config = Config { log_level: "debug".into(), ..Config::default() };
        let _ = config.init_tracing();
        assert!(config.init_tracing().is_err());
    }
}
