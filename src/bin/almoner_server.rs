//!
//! almoner server binary
//! ---------------------
//! Command-line entry point for the session/CSRF/role gateway. Supports
//! configuration via CLI flags and `ALMONER_*` environment variables.

use anyhow::Result;
use std::env;

use almoner::config::{has_flag, Config, DEFAULT_HTTP_PORT};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber with env filter, defaulting to info
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("almoner server\n\nUSAGE:\n  almoner_server [--http-port N] [--backend-url URL] [--realtime-url URL|--no-realtime] [--insecure-cookies]\n\nOPTIONS:\n  --http-port N         HTTP API port (env: ALMONER_HTTP_PORT, default {})\n  --backend-url URL     Auth platform base URL (env: ALMONER_BACKEND_URL)\n  --realtime-url URL    Change-feed WebSocket URL (env: ALMONER_REALTIME_URL)\n  --no-realtime         Disable realtime role cache invalidation\n  --insecure-cookies    Drop the Secure cookie attribute (local development over http)\n\nENVIRONMENT:\n  ALMONER_ANON_KEY, ALMONER_SERVICE_KEY, ALMONER_COOKIE_SECRET, ALMONER_COOKIE_SECURE,\n  ALMONER_ROLE_CACHE_TTL_SECS, ALMONER_FALLBACK_TTL_SECS, ALMONER_ROLE_FETCH_RETRIES,\n  ALMONER_RETRY_BASE_MS, ALMONER_SESSION_IDLE_SECS, ALMONER_SWEEP_INTERVAL_SECS,\n  ALMONER_ROLES_TABLE, ALMONER_SESSIONS_TABLE\n", DEFAULT_HTTP_PORT);
        return Ok(());
    }

    let config = Config::from_env_and_args(&args)?;
    tracing::info!(target: "startup", "Using port: http={}, backend={}", config.http_port, config.backend_url);
    almoner::server::run_with_config(config).await
}
