use axum::extract::FromRequestParts;
use axum::http::header::USER_AGENT;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::cookies::{parse_cookie, ROLE_COOKIE, SESSION_COOKIE};
use crate::error::{AppError, AppResult};
use crate::security::{sign_value, verify_signed_value};
use crate::server::AppState;

use super::role::{Role, RoleSet};
use super::session::Session;

/// Authenticated caller of the current request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub request_id: String,
    pub session: Session,
    pub roles: RoleSet,
    /// Role chosen through the role switch, when its cookie is valid for this user.
    pub active_role: Option<Role>,
    pub effective_role: Role,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub user_id: String,
    pub email: Option<String>,
    pub roles: Vec<Role>,
    pub active_role: Option<Role>,
    pub effective_role: Role,
}

impl AuthContext {
    pub fn user_id(&self) -> &str { &self.session.user_id }

    /// 403 unless the effective role ranks at least `required`.
    pub fn require(&self, required: Role) -> AppResult<()> {
        if self.effective_role.satisfies(required) {
            Ok(())
        } else {
            debug!(target: "auth", user_id = %self.session.user_id, effective = %self.effective_role, required = %required, "role check denied");
            Err(AppError::forbidden("insufficient_role".to_string(), format!("requires role {} or higher", required)))
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            user_id: self.session.user_id.clone(),
            email: self.session.email.clone(),
            roles: self.roles.held(),
            active_role: self.active_role,
            effective_role: self.effective_role,
        }
    }
}

/// Cookie value for the role switch: `<user_id>.<role>.<sig>`.
pub fn encode_active_role(secret: &[u8], user_id: &str, role: Role) -> anyhow::Result<String> {
    sign_value(secret, &format!("{}.{}", user_id, role))
}

/// The selected role, if the cookie is authentic and bound to `user_id`.
pub fn decode_active_role(secret: &[u8], cookie: &str, user_id: &str) -> Option<Role> {
    let payload = verify_signed_value(secret, cookie)?;
    let (uid, role) = payload.rsplit_once('.')?;
    if uid != user_id {
        return None;
    }
    role.parse::<Role>().ok()
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(USER_AGENT).and_then(|v| v.to_str().ok())
}

impl AuthContext {
    /// Resolve the caller from request headers: session cookie, platform token
    /// refresh, role lookup and the optional role override.
    pub async fn from_headers(state: &AppState, headers: &HeaderMap) -> AppResult<Self> {
        let Some(sid) = parse_cookie(headers, SESSION_COOKIE) else {
            return Err(AppError::auth("no_session", "sign in required"));
        };
        let ua = user_agent(headers);
        let mut session = state
            .sessions
            .validate(&sid, ua)
            .map_err(|e| AppError::auth(e.code().to_string(), format!("session rejected: {}", e)))?;

        if session.needs_refresh(Utc::now()) {
            session = refresh_tokens(state, &sid).await?;
        }

        let roles = state.resolver.roles_for(&session.user_id).await;
        let active_role = parse_cookie(headers, ROLE_COOKIE)
            .and_then(|c| decode_active_role(&state.config.cookie_secret, &c, &session.user_id));
        let effective_role = roles.effective_role(active_role);

        Ok(AuthContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            session,
            roles,
            active_role,
            effective_role,
        })
    }
}

/// Refresh the platform tokens of session `sid`, one refresh per session at a time.
/// Concurrent requests wait for the running refresh and reuse its tokens, since
/// the platform may rotate refresh tokens and reject a second use.
async fn refresh_tokens(state: &AppState, sid: &str) -> AppResult<Session> {
    let Some(lock) = state.sessions.refresh_lock(sid) else {
        return Err(AppError::auth("session_not_found", "session rejected: session_not_found"));
    };
    let _guard = lock.lock().await;
    let mut session = match state.sessions.get(sid) {
        Some(current) if current.revoked => {
            return Err(AppError::auth("session_revoked", "session rejected: session_revoked"));
        }
        Some(current) if !current.needs_refresh(Utc::now()) => {
            debug!(target: "auth", user_id = %current.user_id, "tokens refreshed by a concurrent request");
            return Ok(current);
        }
        Some(current) => current,
        None => return Err(AppError::auth("session_not_found", "session rejected: session_not_found")),
    };

    match state.backend.refresh(&session.refresh_token).await {
        Ok(grant) => {
            if let Some(updated) = state.sessions.update_tokens(sid, &grant) {
                session = updated;
            }
        }
        Err(BackendError::Rejected { status, message }) => {
            warn!(target: "auth", user_id = %session.user_id, status, "token refresh rejected: {}", message);
            state.sessions.revoke(sid);
            return Err(AppError::auth("session_refresh_failed", "session could not be refreshed"));
        }
        // Platform unreachable: keep the current token; RLS rejects it if it is stale
        Err(e) => warn!(target: "auth", user_id = %session.user_id, error = %e, "token refresh failed"),
    }
    Ok(session)
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        AuthContext::from_headers(state, &parts.headers).await
    }
}
