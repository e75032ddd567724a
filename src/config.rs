//! Runtime configuration loaded from the environment.
//!
//! Credentials are wrapped in `Zeroizing` so they are wiped from memory on
//! drop. Every recognized key has a default suited to a testnet dry run;
//! production deployments set the full set explicitly.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use zeroize::Zeroizing;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid value for {}, using default", key);
            default
        }),
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Which venue adapter to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Venue {
    Gate,
    Binance,
}

impl FromStr for Venue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gate" => Ok(Venue::Gate),
            "binance" => Ok(Venue::Binance),
            other => Err(format!("unknown venue: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        DatabaseConfig {
            url: env_string("DATABASE_URL", "sqlite://data/helmsman.db"),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
        }
    }
}

pub struct ExchangeCredentials {
    pub venue: Venue,
    pub api_key: Zeroizing<String>,
    pub api_secret: Zeroizing<String>,
    pub testnet: bool,
}

impl ExchangeCredentials {
    pub fn from_env() -> Self {
        ExchangeCredentials {
            venue: env_parse("EXCHANGE", Venue::Gate),
            api_key: Zeroizing::new(env_string("EXCHANGE_API_KEY", "")),
            api_secret: Zeroizing::new(env_string("EXCHANGE_API_SECRET", "")),
            testnet: env_parse("EXCHANGE_TESTNET", true),
        }
    }
}

/// SMTP settings handed to the mail collaborator when present.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Zeroizing<String>,
    pub from_address: String,
    pub to_address: String,
}

impl SmtpConfig {
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;
        Some(SmtpConfig {
            host,
            port: env_parse("SMTP_PORT", 587),
            username: env_string("SMTP_USER", ""),
            password: Zeroizing::new(env_string("SMTP_PASS", "")),
            from_address: env_string("SMTP_FROM", ""),
            to_address: env_string("SMTP_TO", ""),
        })
    }
}

pub struct AppConfig {
    pub symbols: Vec<String>,
    pub trading_interval: Duration,
    pub reversal_interval: Duration,
    pub resolve_interval: Duration,
    pub health_interval: Duration,
    pub price_order_check_interval: Duration,
    pub max_opportunities: usize,
    pub min_open_score: f64,
    pub api_port: u16,
    pub database: DatabaseConfig,
    pub exchange: ExchangeCredentials,
    pub smtp: Option<SmtpConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let symbols: Vec<String> = env_string("TRADING_SYMBOLS", "BTC,ETH,SOL")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        AppConfig {
            symbols,
            trading_interval: Duration::from_secs(
                env_parse("TRADING_INTERVAL_MINUTES", 15u64) * 60,
            ),
            reversal_interval: Duration::from_secs(
                env_parse("REVERSAL_MONITOR_INTERVAL_MINUTES", 3u64) * 60,
            ),
            resolve_interval: Duration::from_secs(env_parse("RESOLVE_INTERVAL_MINUTES", 10u64) * 60),
            health_interval: Duration::from_secs(
                env_parse("HEALTH_CHECK_INTERVAL_MINUTES", 5u64) * 60,
            ),
            price_order_check_interval: Duration::from_secs(env_parse(
                "PRICE_ORDER_CHECK_INTERVAL",
                30u64,
            )),
            max_opportunities: env_parse("MAX_OPPORTUNITIES_TO_SHOW", 5usize),
            min_open_score: env_parse("MIN_OPPORTUNITY_SCORE", 60.0f64),
            api_port: env_parse("API_PORT", 3000u16),
            database: DatabaseConfig::from_env(),
            exchange: ExchangeCredentials::from_env(),
            smtp: SmtpConfig::from_env(),
        }
    }
}
