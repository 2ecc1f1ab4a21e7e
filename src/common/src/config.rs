//! Configuration loading from environment variables.

use std::env;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Gamma API base URL (market metadata)
    pub gamma_base_url: String,

    /// CLOB REST API base URL (order submission, book fetch)
    pub clob_base_url: String,

    /// CLOB WebSocket URL (orderbook streaming)
    pub clob_ws_url: String,

    /// Polygon JSON-RPC endpoint (on-chain balance)
    pub polygon_rpc_url: String,

    /// Simulate trades without submitting orders
    pub dry_run: bool,

    /// Minimum profit threshold as a fraction (0.005 = 0.5%)
    pub min_profit_threshold: Decimal,

    /// Maximum position size in USD per market
    pub max_position_size_usd: Decimal,

    /// Minimum market liquidity in USD for candidate selection
    pub min_liquidity_usd: Decimal,

    /// Skip markets resolving further out than this many days
    pub max_days_until_resolution: i64,

    /// Number of WebSocket connections for the scanner
    pub num_ws_connections: usize,

    /// Seconds between polls (legacy polling mode only)
    pub poll_interval_seconds: f64,

    /// Wallet private key, 0x-prefixed hex (live trading only)
    pub private_key: Option<String>,

    /// Wallet address, 0x-prefixed (live trading only)
    pub wallet_address: Option<String>,

    /// CLOB API key (L2 auth)
    pub poly_api_key: Option<String>,

    /// CLOB API secret, base64 (L2 auth)
    pub poly_api_secret: Option<String>,

    /// CLOB API passphrase (L2 auth)
    pub poly_api_passphrase: Option<String>,

    /// SOCKS5 proxy host for order-submission traffic
    pub socks5_proxy_host: Option<String>,
    pub socks5_proxy_port: u16,
    pub socks5_proxy_user: Option<String>,
    pub socks5_proxy_pass: Option<String>,

    /// Slack webhook for operator notifications
    pub slack_webhook_url: Option<String>,

    /// Logging level (used when RUST_LOG is unset)
    pub log_level: String,
}

fn var_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn var_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no .env file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let gamma_base_url = env::var("GAMMA_BASE_URL")
            .unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string());

        let clob_base_url = env::var("CLOB_BASE_URL")
            .unwrap_or_else(|_| "https://clob.polymarket.com".to_string());

        let clob_ws_url = env::var("CLOB_WS_URL")
            .unwrap_or_else(|_| "wss://ws-subscriptions-clob.polymarket.com/ws".to_string());

        let polygon_rpc_url =
            env::var("POLYGON_RPC_URL").unwrap_or_else(|_| "https://polygon-rpc.com".to_string());

        let min_profit_threshold: Decimal = var_parsed("MIN_PROFIT_THRESHOLD", Decimal::new(5, 3));
        if min_profit_threshold < Decimal::ZERO || min_profit_threshold > Decimal::new(1, 1) {
            return Err(ConfigError::InvalidValue {
                var: "MIN_PROFIT_THRESHOLD".to_string(),
                reason: "must be in [0, 0.1]".to_string(),
            });
        }

        let max_days_until_resolution: i64 = var_parsed("MAX_DAYS_UNTIL_RESOLUTION", 7);
        if !(1..=365).contains(&max_days_until_resolution) {
            return Err(ConfigError::InvalidValue {
                var: "MAX_DAYS_UNTIL_RESOLUTION".to_string(),
                reason: "must be in [1, 365]".to_string(),
            });
        }

        let num_ws_connections: usize = var_parsed("NUM_WS_CONNECTIONS", 6);
        if !(1..=20).contains(&num_ws_connections) {
            return Err(ConfigError::InvalidValue {
                var: "NUM_WS_CONNECTIONS".to_string(),
                reason: "must be in [1, 20]".to_string(),
            });
        }

        let private_key = var_opt("PRIVATE_KEY");
        if let Some(ref key) = private_key {
            if !key.starts_with("0x") || key.len() != 66 {
                return Err(ConfigError::InvalidValue {
                    var: "PRIVATE_KEY".to_string(),
                    reason: "must be 0x + 64 hex chars".to_string(),
                });
            }
        }

        let wallet_address = var_opt("WALLET_ADDRESS").map(|a| a.to_lowercase());
        if let Some(ref addr) = wallet_address {
            if !addr.starts_with("0x") || addr.len() != 42 {
                return Err(ConfigError::InvalidValue {
                    var: "WALLET_ADDRESS".to_string(),
                    reason: "must be 0x + 40 hex chars".to_string(),
                });
            }
        }

        Ok(Self {
            database_url,
            gamma_base_url,
            clob_base_url,
            clob_ws_url,
            polygon_rpc_url,
            dry_run: var_parsed("DRY_RUN", true),
            min_profit_threshold,
            max_position_size_usd: var_parsed("MAX_POSITION_SIZE_USD", Decimal::new(100, 0)),
            min_liquidity_usd: var_parsed("MIN_LIQUIDITY_USD", Decimal::new(10_000, 0)),
            max_days_until_resolution,
            num_ws_connections,
            poll_interval_seconds: var_parsed("POLL_INTERVAL_SECONDS", 2.0),
            private_key,
            wallet_address,
            poly_api_key: var_opt("POLY_API_KEY"),
            poly_api_secret: var_opt("POLY_API_SECRET"),
            poly_api_passphrase: var_opt("POLY_API_PASSPHRASE"),
            socks5_proxy_host: var_opt("SOCKS5_PROXY_HOST"),
            socks5_proxy_port: var_parsed("SOCKS5_PROXY_PORT", 1080),
            socks5_proxy_user: var_opt("SOCKS5_PROXY_USER"),
            socks5_proxy_pass: var_opt("SOCKS5_PROXY_PASS"),
            slack_webhook_url: var_opt("SLACK_WEBHOOK_URL"),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Check if live trading credentials are configured.
    pub fn is_trading_enabled(&self) -> bool {
        self.private_key.is_some() && self.wallet_address.is_some()
    }

    /// SOCKS5 proxy URL for order-submission traffic, if configured.
    ///
    /// Uses the socks5h:// scheme so DNS resolution happens through the
    /// proxy as well.
    pub fn socks5_proxy_url(&self) -> Option<String> {
        let host = self.socks5_proxy_host.as_ref()?;
        match (&self.socks5_proxy_user, &self.socks5_proxy_pass) {
            (Some(user), Some(pass)) => Some(format!(
                "socks5h://{}:{}@{}:{}",
                user, pass, host, self.socks5_proxy_port
            )),
            _ => Some(format!("socks5h://{}:{}", host, self.socks5_proxy_port)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_all() {
        for var in [
            "DATABASE_URL",
            "MIN_PROFIT_THRESHOLD",
            "MAX_DAYS_UNTIL_RESOLUTION",
            "NUM_WS_CONNECTIONS",
            "PRIVATE_KEY",
            "WALLET_ADDRESS",
            "SOCKS5_PROXY_HOST",
            "SOCKS5_PROXY_USER",
            "SOCKS5_PROXY_PASS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_database_url() {
        clear_all();

        let result = Config::from_env_only();
        assert!(result.is_err());

        if let Err(ConfigError::MissingVar(var)) = result {
            assert_eq!(var, "DATABASE_URL");
        } else {
            panic!("Expected MissingVar error");
        }
    }

    #[test]
    #[serial]
    fn test_config_with_defaults() {
        clear_all();
        env::set_var("DATABASE_URL", "postgres://localhost/test");

        let config = Config::from_env_only().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.gamma_base_url, "https://gamma-api.polymarket.com");
        assert_eq!(config.clob_base_url, "https://clob.polymarket.com");
        assert!(config.dry_run);
        assert_eq!(config.min_profit_threshold, Decimal::new(5, 3));
        assert_eq!(config.num_ws_connections, 6);
        assert_eq!(config.max_days_until_resolution, 7);
        assert!(!config.is_trading_enabled());
        assert!(config.socks5_proxy_url().is_none());

        env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn test_config_rejects_out_of_range_threshold() {
        clear_all();
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("MIN_PROFIT_THRESHOLD", "0.5");

        let result = Config::from_env_only();
        assert!(result.is_err());

        env::remove_var("MIN_PROFIT_THRESHOLD");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn test_config_rejects_malformed_private_key() {
        clear_all();
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("PRIVATE_KEY", "deadbeef");

        let result = Config::from_env_only();
        assert!(result.is_err());

        env::remove_var("PRIVATE_KEY");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn test_socks5_proxy_url_with_auth() {
        clear_all();
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("SOCKS5_PROXY_HOST", "10.0.0.2");
        env::set_var("SOCKS5_PROXY_USER", "u");
        env::set_var("SOCKS5_PROXY_PASS", "p");

        let config = Config::from_env_only().unwrap();
        assert_eq!(
            config.socks5_proxy_url().unwrap(),
            "socks5h://u:p@10.0.0.2:1080"
        );

        clear_all();
    }
}
