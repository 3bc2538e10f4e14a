//!
//! almoner HTTP server
//! -------------------
//! This module defines the Axum-based HTTP API in front of the auth platform.
//!
//! Responsibilities:
//! - Session management with a session cookie backed by the `identity` registry.
//! - Double-submit CSRF protection for every state-changing request, with token
//!   rotation after sign-in, sign-up and password change.
//! - Sign-in/sign-up/sign-out/password endpoints delegating to the platform.
//! - Role inspection and role switching through a signed cookie.
//! - Background sweeping of expired cache entries and sessions, and the
//!   realtime invalidation listener.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Request, State};
use axum::http::header::{SET_COOKIE, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, SignUpOutcome, TokenGrant};
use crate::config::Config;
use crate::cookies::{parse_cookie, CookieJar, CSRF_COOKIE, CSRF_HEADER, CSRF_ROTATED_HEADER, ROLE_COOKIE, SESSION_COOKIE};
use crate::error::{AppError, AppResult};
use crate::identity::{encode_active_role, AuthContext, RetryPolicy, Role, RoleCache, RoleResolver, SessionManager};
use crate::realtime::{self, Invalidator};
use crate::security::{self, CsrfCheck};

/// Shared server state injected into all handlers.
///
/// Holds the platform client, the session registry and the role resolver
/// (which owns the role cache). All members are cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: BackendClient,
    pub sessions: SessionManager,
    pub resolver: RoleResolver,
    pub cookies: CookieJar,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let backend = BackendClient::new(&config.backend_url, &config.anon_key, &config.service_key)
            .context("while building the auth platform client")?;
        let cache = RoleCache::new(config.role_cache_ttl, config.fallback_ttl);
        let retry = RetryPolicy { retries: config.role_fetch_retries, base: config.retry_base };
        let resolver = RoleResolver::new(Arc::new(backend.clone()), cache, retry);
        Ok(Self {
            sessions: SessionManager::new(config.session_idle_ttl),
            cookies: CookieJar::new(config.cookie_secure),
            config: Arc::new(config),
            backend,
            resolver,
        })
    }

    pub fn invalidator(&self) -> Invalidator {
        Invalidator {
            roles_table: self.config.roles_table.clone(),
            sessions_table: self.config.sessions_table.clone(),
            cache: self.resolver.cache().clone(),
            sessions: self.sessions.clone(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "almoner ok" }))
        .route("/auth/csrf", get(get_csrf))
        .route("/auth/sign-in", post(sign_in))
        .route("/auth/sign-up", post(sign_up))
        .route("/auth/sign-out", post(sign_out))
        .route("/auth/password", post(change_password))
        .route("/auth/session", get(get_session))
        .route("/auth/role", post(switch_role).delete(clear_role))
        .route("/admin/roles/invalidate", post(admin_invalidate))
        .layer(middleware::from_fn(csrf_guard))
        .with_state(state)
}

fn log_startup(cfg: &Config) {
    info!(
        target: "startup",
        "almoner starting: http_port={}, backend_url={}, realtime={}, cookie_secure={}, role_cache_ttl_secs={}, fallback_ttl_secs={}, role_fetch_retries={}",
        cfg.http_port,
        cfg.backend_url,
        cfg.realtime_url.as_deref().unwrap_or("<disabled>"),
        cfg.cookie_secure,
        cfg.role_cache_ttl.as_secs(),
        cfg.fallback_ttl.as_secs(),
        cfg.role_fetch_retries,
    );
    if cfg.anon_key.is_empty() {
        warn!(target: "startup", "ALMONER_ANON_KEY is empty; platform calls will likely be rejected");
    }
}

/// Periodically drop expired role cache entries and dead sessions.
pub fn spawn_sweeper(state: &AppState) -> tokio::task::JoinHandle<()> {
    let cache = state.resolver.cache().clone();
    let sessions = state.sessions.clone();
    let every = state.config.effective_sweep_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            let roles = cache.sweep();
            let dead = sessions.sweep();
            if roles > 0 || dead > 0 {
                debug!(target: "sweep", roles, sessions = dead, "swept expired entries");
            }
        }
    })
}

/// Serve the API on an already bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Start the server with the given configuration and run until the process exits.
pub async fn run_with_config(config: Config) -> anyhow::Result<()> {
    log_startup(&config);
    let state = AppState::new(config)?;

    spawn_sweeper(&state);
    if let Some(url) = state.config.realtime_url.clone() {
        realtime::spawn_listener(url, state.config.anon_key.clone(), state.invalidator());
    } else {
        info!(target: "startup", "realtime invalidation disabled; role cache relies on TTL only");
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", state.config.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("while binding {}", addr))?;
    serve(listener, state).await
}

/// Reject state-changing requests whose CSRF header does not match the cookie.
async fn csrf_guard(req: Request, next: Next) -> Response {
    if req.method().is_safe() {
        return next.run(req).await;
    }
    let headers = req.headers();
    let cookie = parse_cookie(headers, CSRF_COOKIE);
    let header = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok());
    match security::check_csrf(cookie.as_deref(), header) {
        CsrfCheck::Valid => next.run(req).await,
        CsrfCheck::Missing => {
            debug!(target: "auth", path = %req.uri().path(), "csrf token missing");
            AppError::csrf("csrf_missing", "csrf token missing").into_response()
        }
        CsrfCheck::Mismatch => {
            warn!(target: "auth", path = %req.uri().path(), "csrf token mismatch");
            AppError::csrf("csrf_mismatch", "csrf token mismatch").into_response()
        }
    }
}

fn header_value(v: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(v).map_err(|e| AppError::internal("header_encoding".to_string(), e.to_string()))
}

/// Issue a fresh CSRF token: new cookie plus the rotation header.
fn rotate_csrf(jar: &CookieJar, out: &mut HeaderMap) -> AppResult<String> {
    let token = security::generate_csrf_token()?;
    out.append(SET_COOKIE, jar.csrf(&token)?);
    out.insert(CSRF_ROTATED_HEADER, header_value(&token)?);
    Ok(token)
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(USER_AGENT).and_then(|v| v.to_str().ok())
}

#[derive(Debug, Deserialize)]
struct CredentialsPayload { email: String, password: String }

impl CredentialsPayload {
    fn validate(&self) -> AppResult<()> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::user("invalid_email", "a valid email address is required"));
        }
        if self.password.is_empty() {
            return Err(AppError::user("invalid_password", "password is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PasswordPayload { password: String }

#[derive(Debug, Deserialize)]
struct RolePayload { role: String }

#[derive(Debug, Deserialize)]
struct InvalidatePayload {
    #[serde(default)]
    user_id: Option<String>,
}

async fn get_csrf(State(state): State<AppState>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    let mut out = HeaderMap::new();
    let token = match parse_cookie(&headers, CSRF_COOKIE) {
        Some(t) => t,
        None => {
            let t = security::generate_csrf_token()?;
            out.append(SET_COOKIE, state.cookies.csrf(&t)?);
            t
        }
    };
    out.insert(CSRF_HEADER, header_value(&token)?);
    Ok((StatusCode::OK, out, Json(json!({"status": "ok", "csrf": token}))))
}

/// Register a platform session locally and build the sign-in response headers.
fn start_session(state: &AppState, grant: &TokenGrant, headers: &HeaderMap, out: &mut HeaderMap) -> AppResult<()> {
    // The browser's previous session is replaced, not left to idle out
    if let Some(previous) = parse_cookie(headers, SESSION_COOKIE) {
        if state.sessions.revoke(&previous) {
            debug!(target: "auth", "previous session revoked on new sign-in");
        }
    }
    let session = state.sessions.issue(grant, user_agent(headers))?;
    // Roles are re-read on every sign-in
    state.resolver.cache().invalidate(&session.user_id);
    out.append(SET_COOKIE, state.cookies.session(&session.session_id)?);
    out.append(SET_COOKIE, state.cookies.clear(ROLE_COOKIE)?);
    Ok(())
}

async fn sign_in(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<CredentialsPayload>) -> AppResult<impl IntoResponse> {
    payload.validate()?;
    let grant = state.backend.sign_in_with_password(payload.email.trim(), &payload.password).await?;
    let mut out = HeaderMap::new();
    start_session(&state, &grant, &headers, &mut out)?;
    rotate_csrf(&state.cookies, &mut out)?;
    info!(target: "auth", user_id = %grant.user.id, "sign-in");
    Ok((StatusCode::OK, out, Json(json!({"status": "ok", "user_id": grant.user.id}))))
}

async fn sign_up(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<CredentialsPayload>) -> AppResult<impl IntoResponse> {
    payload.validate()?;
    let outcome = state.backend.sign_up(payload.email.trim(), &payload.password).await?;
    let mut out = HeaderMap::new();
    let (status, body) = match outcome {
        SignUpOutcome::Session(grant) => {
            start_session(&state, &grant, &headers, &mut out)?;
            info!(target: "auth", user_id = %grant.user.id, "sign-up with immediate session");
            (StatusCode::OK, json!({"status": "ok", "user_id": grant.user.id}))
        }
        SignUpOutcome::ConfirmationRequired(user) => {
            info!(target: "auth", user_id = %user.id, "sign-up pending confirmation");
            (StatusCode::ACCEPTED, json!({"status": "confirmation_required", "user_id": user.id}))
        }
    };
    rotate_csrf(&state.cookies, &mut out)?;
    Ok((status, out, Json(body)))
}

async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    if let Some(sid) = parse_cookie(&headers, SESSION_COOKIE) {
        if let Ok(session) = state.sessions.validate(&sid, user_agent(&headers)) {
            if let Err(e) = state.backend.sign_out(&session.access_token).await {
                warn!(target: "auth", user_id = %session.user_id, error = %e, "platform logout failed; revoking locally");
            }
            state.resolver.cache().invalidate(&session.user_id);
            info!(target: "auth", user_id = %session.user_id, "sign-out");
        }
        state.sessions.revoke(&sid);
    }
    let mut out = HeaderMap::new();
    out.append(SET_COOKIE, state.cookies.clear(SESSION_COOKIE)?);
    out.append(SET_COOKIE, state.cookies.clear(ROLE_COOKIE)?);
    Ok((StatusCode::OK, out, Json(json!({"status": "ok"}))))
}

async fn change_password(ctx: AuthContext, State(state): State<AppState>, Json(payload): Json<PasswordPayload>) -> AppResult<impl IntoResponse> {
    if payload.password.is_empty() {
        return Err(AppError::user("invalid_password", "password is required"));
    }
    state.backend.update_password(&ctx.session.access_token, &payload.password).await?;
    let revoked = state.sessions.revoke_user_except(ctx.user_id(), Some(&ctx.session.session_id));
    let mut out = HeaderMap::new();
    rotate_csrf(&state.cookies, &mut out)?;
    info!(target: "auth", user_id = %ctx.user_id(), revoked, request_id = %ctx.request_id, "password changed");
    Ok((StatusCode::OK, out, Json(json!({"status": "ok", "sessions_revoked": revoked}))))
}

async fn get_session(ctx: AuthContext) -> impl IntoResponse {
    Json(json!({"status": "ok", "session": ctx.view()}))
}

async fn switch_role(ctx: AuthContext, State(state): State<AppState>, Json(payload): Json<RolePayload>) -> AppResult<impl IntoResponse> {
    let role: Role = payload
        .role
        .parse()
        .map_err(|e: crate::identity::UnknownRole| AppError::user("unknown_role".to_string(), e.to_string()))?;
    if !ctx.roles.holds(role) {
        return Err(AppError::forbidden("role_not_held".to_string(), format!("you do not hold the {} role", role)));
    }
    let signed = encode_active_role(&state.config.cookie_secret, ctx.user_id(), role)?;
    let mut out = HeaderMap::new();
    out.append(SET_COOKIE, state.cookies.active_role(&signed)?);
    let effective = ctx.roles.effective_role(Some(role));
    info!(target: "auth", user_id = %ctx.user_id(), role = %role, effective = %effective, "role switched");
    Ok((StatusCode::OK, out, Json(json!({"status": "ok", "active_role": role, "effective_role": effective}))))
}

async fn clear_role(ctx: AuthContext, State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let mut out = HeaderMap::new();
    out.append(SET_COOKIE, state.cookies.clear(ROLE_COOKIE)?);
    let effective = ctx.roles.effective_role(None);
    Ok((StatusCode::OK, out, Json(json!({"status": "ok", "active_role": null, "effective_role": effective}))))
}

async fn admin_invalidate(ctx: AuthContext, State(state): State<AppState>, Json(payload): Json<InvalidatePayload>) -> AppResult<impl IntoResponse> {
    ctx.require(Role::Admin)?;
    let cache = state.resolver.cache();
    let invalidated = match payload.user_id.as_deref() {
        Some(uid) => usize::from(cache.invalidate(uid)),
        None => cache.clear(),
    };
    info!(target: "roles", admin = %ctx.user_id(), target_user = ?payload.user_id, invalidated, "manual role cache invalidation");
    Ok(Json(json!({"status": "ok", "invalidated": invalidated})))
}
