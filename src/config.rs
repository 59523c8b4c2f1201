use std::str::FromStr;

use chrono::NaiveTime;

use crate::model::{Money, Ms};

/// Engine-level knobs shared by every tenant.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Inactivity window after which a regular user's pending cart expires.
    pub cart_ttl_ms: Ms,
    /// Business time a promoted waitlist entry gets to pay.
    pub payment_window_ms: Ms,
    pub business_open: NaiveTime,
    pub business_close: NaiveTime,
    /// How early before the start a check-in is accepted.
    pub check_in_grace_ms: Ms,
    pub hourly_rate: Money,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            cart_ttl_ms: 15 * 60_000,
            payment_window_ms: 2 * 3_600_000,
            business_open: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            business_close: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            check_in_grace_ms: 30 * 60_000,
            hourly_rate: 2_000,
        }
    }
}

/// Process configuration, read once from `COURTSIDE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: String,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub sweep_interval_ms: u64,
    pub policy: Policy,
}

/// Shortest reaper period; `tokio::time::interval` panics on zero.
pub const MIN_SWEEP_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;

fn sweep_interval_ms(secs: Option<u64>) -> u64 {
    secs.map_or(DEFAULT_SWEEP_INTERVAL_MS, |s| s.saturating_mul(1000))
        .max(MIN_SWEEP_INTERVAL_MS)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_time(key: &str) -> Option<NaiveTime> {
    std::env::var(key)
        .ok()
        .and_then(|s| crate::interval::parse_time(&s))
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Policy::default();
        let policy = Policy {
            cart_ttl_ms: env_parse::<Ms>("COURTSIDE_CART_TTL_SECS")
                .map_or(defaults.cart_ttl_ms, |s| s * 1000),
            payment_window_ms: env_parse::<Ms>("COURTSIDE_PAYMENT_WINDOW_SECS")
                .map_or(defaults.payment_window_ms, |s| s * 1000),
            business_open: env_time("COURTSIDE_BUSINESS_OPEN").unwrap_or(defaults.business_open),
            business_close: env_time("COURTSIDE_BUSINESS_CLOSE").unwrap_or(defaults.business_close),
            check_in_grace_ms: env_parse::<Ms>("COURTSIDE_CHECK_IN_GRACE_SECS")
                .map_or(defaults.check_in_grace_ms, |s| s * 1000),
            hourly_rate: env_parse("COURTSIDE_HOURLY_RATE").unwrap_or(defaults.hourly_rate),
        };

        Self {
            port: env_parse("COURTSIDE_PORT").unwrap_or(5433),
            bind: std::env::var("COURTSIDE_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            data_dir: std::env::var("COURTSIDE_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            password: std::env::var("COURTSIDE_PASSWORD").unwrap_or_else(|_| "courtside".into()),
            max_connections: env_parse("COURTSIDE_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: env_parse("COURTSIDE_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: env_parse("COURTSIDE_METRICS_PORT"),
            tls_cert: std::env::var("COURTSIDE_TLS_CERT").ok(),
            tls_key: std::env::var("COURTSIDE_TLS_KEY").ok(),
            sweep_interval_ms: sweep_interval_ms(env_parse("COURTSIDE_SWEEP_INTERVAL_SECS")),
            policy,
        }
    }
}
