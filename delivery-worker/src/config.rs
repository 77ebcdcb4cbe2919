//! Configuration module for environment variable parsing.
//!
//! Every setting has a default so the engine can boot with nothing but an
//! empty environment (in-memory store, log-only provider).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Which outbound backend the provider adapter routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Mailgun,
    Resend,
    /// Dry run: log the message and fabricate an id.
    Log,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mailgun" => Ok(ProviderKind::Mailgun),
            "resend" => Ok(ProviderKind::Resend),
            "log" | "" => Ok(ProviderKind::Log),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// SQLite database file. `None` selects the in-memory store.
    pub database_path: Option<String>,

    /// Shared secret the external timer must present as a bearer token
    pub cron_secret: Option<String>,

    pub provider: ProviderKind,

    /// Sender address used by every outbound message
    pub from_address: String,

    pub mailgun_api_key: Option<String>,
    pub mailgun_domain: Option<String>,
    pub mailgun_api_base: String,

    pub resend_api_key: Option<String>,
    pub resend_api_base: String,

    /// Mailgun signing key for HMAC verification of event webhooks
    pub mailgun_signing_key: Option<String>,

    /// Maximum age in seconds for Mailgun webhook timestamps
    pub mailgun_signature_max_age: u64,

    /// Upper bound on a single provider send
    pub provider_timeout_ms: u64,

    /// Maximum entries pulled per dispatch cycle
    pub dispatch_batch_size: usize,

    /// Maximum concurrent sends within one batch
    pub dispatch_concurrency: usize,

    /// Age after which a `processing` claim is treated as stranded
    pub claim_lease_secs: u64,

    /// Interval between cycles in the worker binary
    pub tick_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            database_path: None,
            cron_secret: None,
            provider: ProviderKind::Log,
            from_address: "noreply@localhost".to_string(),
            mailgun_api_key: None,
            mailgun_domain: None,
            mailgun_api_base: "https://api.mailgun.net".to_string(),
            resend_api_key: None,
            resend_api_base: "https://api.resend.com".to_string(),
            mailgun_signing_key: None,
            mailgun_signature_max_age: 300,
            provider_timeout_ms: 10_000,
            dispatch_batch_size: 50,
            dispatch_concurrency: 10,
            claim_lease_secs: 300,
            tick_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            port: parse_or("PORT", defaults.port),

            database_path: non_empty("DATABASE_PATH"),

            cron_secret: non_empty("CRON_SECRET"),

            provider: parse_or("EMAIL_PROVIDER", defaults.provider),

            from_address: non_empty("EMAIL_FROM").unwrap_or(defaults.from_address),

            mailgun_api_key: non_empty("MAILGUN_API_KEY"),
            mailgun_domain: non_empty("MAILGUN_DOMAIN"),
            mailgun_api_base: non_empty("MAILGUN_API_BASE").unwrap_or(defaults.mailgun_api_base),

            resend_api_key: non_empty("RESEND_API_KEY"),
            resend_api_base: non_empty("RESEND_API_BASE").unwrap_or(defaults.resend_api_base),

            mailgun_signing_key: non_empty("MAILGUN_SIGNING_KEY"),
            mailgun_signature_max_age: parse_or(
                "MAILGUN_SIGNATURE_MAX_AGE",
                defaults.mailgun_signature_max_age,
            ),

            provider_timeout_ms: parse_or("PROVIDER_TIMEOUT_MS", defaults.provider_timeout_ms),

            dispatch_batch_size: parse_or("DISPATCH_BATCH_SIZE", defaults.dispatch_batch_size)
                .max(1),

            dispatch_concurrency: parse_or("DISPATCH_CONCURRENCY", defaults.dispatch_concurrency)
                .max(1),

            claim_lease_secs: parse_or("CLAIM_LEASE_SECS", defaults.claim_lease_secs),

            tick_interval_secs: parse_or("TICK_INTERVAL_SECS", defaults.tick_interval_secs)
                .max(1),
        }
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    /// Claim lease as a chrono duration, saturating at `TimeDelta::MAX`.
    pub fn claim_lease(&self) -> chrono::Duration {
        i64::try_from(self.claim_lease_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Read a variable, treating blank values as unset.
fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable, logging and falling back to `default` on bad input.
fn parse_or<T>(name: &str, default: T) -> T
where
    T: FromStr,
{
    let raw = match non_empty(name) {
        Some(v) => v,
        None => return default,
    };

    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}
