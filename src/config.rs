//!
//! almoner runtime configuration
//! ------------------------------
//! Settings are read from `ALMONER_*` environment variables, then overridden by
//! command-line flags, then filled from defaults.

use anyhow::{anyhow, Result};
use base64::Engine;
use std::env;
use std::time::Duration;

pub const DEFAULT_HTTP_PORT: u16 = 7979;

/// Floor for the background sweep period.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    /// Base URL of the auth platform (auth and RPC endpoints live under it).
    pub backend_url: String,
    /// Public (anon) API key sent as `apikey` on every platform call.
    pub anon_key: String,
    /// Service key used for server-side RPC calls such as role lookup.
    pub service_key: String,
    /// WebSocket URL of the change feed; `None` disables realtime invalidation.
    pub realtime_url: Option<String>,
    pub roles_table: String,
    pub sessions_table: String,
    /// HMAC key for signed cookies.
    pub cookie_secret: Vec<u8>,
    pub cookie_secure: bool,
    pub role_cache_ttl: Duration,
    pub fallback_ttl: Duration,
    pub role_fetch_retries: u32,
    pub retry_base: Duration,
    pub session_idle_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            backend_url: "http://127.0.0.1:54321".to_string(),
            anon_key: String::new(),
            service_key: String::new(),
            realtime_url: None,
            roles_table: "user_roles".to_string(),
            sessions_table: "user_sessions".to_string(),
            cookie_secret: Vec::new(),
            cookie_secure: true,
            role_cache_ttl: Duration::from_secs(5 * 60),
            fallback_ttl: Duration::from_secs(30),
            role_fetch_retries: 3,
            retry_base: Duration::from_millis(100),
            session_idle_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_str(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_str(name).and_then(|v| v.parse::<T>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_str(name).and_then(|v| parse_bool(&v))
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn random_secret() -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!("failed to generate cookie secret: {}", e))?;
    Ok(buf)
}

impl Config {
    /// Load configuration from the environment only.
    pub fn from_env() -> Result<Self> {
        Self::from_env_and_args(&[])
    }

    /// Load configuration from the environment, letting CLI flags in `args` override it.
    pub fn from_env_and_args(args: &[String]) -> Result<Self> {
        let d = Config::default();

        let http_port = arg_value(args, "--http-port")
            .and_then(|v| v.parse::<u16>().ok())
            .or_else(|| env_parse::<u16>("ALMONER_HTTP_PORT"))
            .unwrap_or(d.http_port);
        let backend_url = arg_value(args, "--backend-url")
            .or_else(|| env_str("ALMONER_BACKEND_URL"))
            .unwrap_or(d.backend_url);
        let backend_url = backend_url.trim_end_matches('/').to_string();
        let anon_key = env_str("ALMONER_ANON_KEY").unwrap_or_default();
        let service_key = env_str("ALMONER_SERVICE_KEY").unwrap_or_else(|| anon_key.clone());

        let realtime_url = if has_flag(args, "--no-realtime") {
            None
        } else {
            arg_value(args, "--realtime-url").or_else(|| env_str("ALMONER_REALTIME_URL"))
        };

        let cookie_secret = match env_str("ALMONER_COOKIE_SECRET") {
            Some(s) => base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .unwrap_or_else(|_| s.into_bytes()),
            None => {
                tracing::warn!(target: "startup", "ALMONER_COOKIE_SECRET not set; using a random per-process secret (role selections reset on restart)");
                random_secret()?
            }
        };
        if cookie_secret.len() < 16 {
            return Err(anyhow!("ALMONER_COOKIE_SECRET must be at least 16 bytes"));
        }

        let cookie_secure = if has_flag(args, "--insecure-cookies") {
            false
        } else {
            env_bool("ALMONER_COOKIE_SECURE").unwrap_or(d.cookie_secure)
        };

        let secs = |name: &str, dflt: Duration| env_parse::<u64>(name).map(Duration::from_secs).unwrap_or(dflt);
        let cfg = Config {
            http_port,
            backend_url,
            anon_key,
            service_key,
            realtime_url,
            roles_table: env_str("ALMONER_ROLES_TABLE").unwrap_or(d.roles_table),
            sessions_table: env_str("ALMONER_SESSIONS_TABLE").unwrap_or(d.sessions_table),
            cookie_secret,
            cookie_secure,
            role_cache_ttl: secs("ALMONER_ROLE_CACHE_TTL_SECS", d.role_cache_ttl),
            fallback_ttl: secs("ALMONER_FALLBACK_TTL_SECS", d.fallback_ttl),
            role_fetch_retries: env_parse::<u32>("ALMONER_ROLE_FETCH_RETRIES").unwrap_or(d.role_fetch_retries),
            retry_base: env_parse::<u64>("ALMONER_RETRY_BASE_MS").map(Duration::from_millis).unwrap_or(d.retry_base),
            session_idle_ttl: secs("ALMONER_SESSION_IDLE_SECS", d.session_idle_ttl),
            sweep_interval: secs("ALMONER_SWEEP_INTERVAL_SECS", d.sweep_interval).max(MIN_SWEEP_INTERVAL),
        };
        Ok(cfg)
    }

    /// Sweep period, never below [`MIN_SWEEP_INTERVAL`] even for hand-built configs.
    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval.max(MIN_SWEEP_INTERVAL)
    }
}
