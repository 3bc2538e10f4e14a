use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::backend::TokenGrant;
use crate::security::{random_token, user_agent_hash};
use crate::tprintln;

pub type SessionId = String;

/// Refresh the platform access token when it has less than this left.
pub const REFRESH_MARGIN_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: String,
    pub email: Option<String>,
    pub ua_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub revoked: bool,
    #[serde(skip)]
    pub access_token: String,
    #[serde(skip)]
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
}

impl Session {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.access_expires_at - chrono::Duration::seconds(REFRESH_MARGIN_SECS) <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    NotFound,
    Revoked,
    Expired,
    DeviceMismatch,
}

impl SessionError {
    pub fn code(self) -> &'static str {
        match self {
            SessionError::NotFound => "session_not_found",
            SessionError::Revoked => "session_revoked",
            SessionError::Expired => "session_expired",
            SessionError::DeviceMismatch => "session_device_mismatch",
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::error::Error for SessionError {}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Session>,
    by_user: HashMap<String, HashSet<SessionId>>,
    /// One platform token refresh at a time per session.
    refresh_locks: HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
}

impl Registry {
    fn remove(&mut self, sid: &str) -> Option<Session> {
        self.refresh_locks.remove(sid);
        let s = self.sessions.remove(sid)?;
        if let Some(set) = self.by_user.get_mut(&s.user_id) {
            set.remove(sid);
            if set.is_empty() { self.by_user.remove(&s.user_id); }
        }
        Some(s)
    }
}

/// Server-side registry of portal sessions, keyed by the id stored in the
/// session cookie. The platform tokens ride along so handlers can act on the
/// user's behalf.
#[derive(Clone)]
pub struct SessionManager {
    idle_ttl: Duration,
    inner: Arc<RwLock<Registry>>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::new(Duration::from_secs(24 * 60 * 60)) }
}

fn expires_at(now: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    now + chrono::Duration::seconds(expires_in.max(0))
}

impl SessionManager {
    pub fn new(idle_ttl: Duration) -> Self {
        Self { idle_ttl, inner: Arc::new(RwLock::new(Registry::default())) }
    }

    fn idle_limit(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.idle_ttl).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    pub fn issue(&self, grant: &TokenGrant, user_agent: Option<&str>) -> anyhow::Result<Session> {
        self.issue_at(grant, user_agent, Utc::now())
    }

    pub fn issue_at(&self, grant: &TokenGrant, user_agent: Option<&str>, now: DateTime<Utc>) -> anyhow::Result<Session> {
        let sess = Session {
            session_id: random_token(32)?,
            user_id: grant.user.id.clone(),
            email: grant.user.email.clone(),
            ua_hash: user_agent_hash(user_agent),
            created_at: now,
            last_seen: now,
            revoked: false,
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone(),
            access_expires_at: expires_at(now, grant.expires_in),
        };
        {
            let mut reg = self.inner.write();
            reg.sessions.insert(sess.session_id.clone(), sess.clone());
            reg.by_user.entry(sess.user_id.clone()).or_default().insert(sess.session_id.clone());
        }
        tprintln!("session.issue user={} ttl_secs={}", sess.user_id, self.idle_ttl.as_secs());
        Ok(sess)
    }

    pub fn validate(&self, sid: &str, user_agent: Option<&str>) -> Result<Session, SessionError> {
        self.validate_at(sid, user_agent, Utc::now())
    }

    /// Check a presented session and mark it seen.
    pub fn validate_at(&self, sid: &str, user_agent: Option<&str>, now: DateTime<Utc>) -> Result<Session, SessionError> {
        let mut reg = self.inner.write();
        let Some(sess) = reg.sessions.get_mut(sid) else { return Err(SessionError::NotFound); };
        if sess.revoked {
            return Err(SessionError::Revoked);
        }
        if now - sess.last_seen > self.idle_limit() {
            reg.remove(sid);
            return Err(SessionError::Expired);
        }
        if sess.ua_hash != user_agent_hash(user_agent) {
            sess.revoked = true;
            tracing::warn!(target: "auth", user_id = %sess.user_id, "session presented from a different device; revoked");
            return Err(SessionError::DeviceMismatch);
        }
        sess.last_seen = now;
        Ok(sess.clone())
    }

    /// Current state of a session without validating or touching it.
    pub fn get(&self, sid: &str) -> Option<Session> {
        self.inner.read().sessions.get(sid).cloned()
    }

    /// Lock serializing token refreshes of one session. Holders must re-read
    /// the session after acquiring it: a refresh may have landed meanwhile.
    pub fn refresh_lock(&self, sid: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        let mut reg = self.inner.write();
        if !reg.sessions.contains_key(sid) {
            return None;
        }
        Some(reg.refresh_locks.entry(sid.to_string()).or_default().clone())
    }

    /// Swap in refreshed platform tokens. Returns the updated session.
    pub fn update_tokens(&self, sid: &str, grant: &TokenGrant) -> Option<Session> {
        let now = Utc::now();
        let mut reg = self.inner.write();
        let sess = reg.sessions.get_mut(sid)?;
        if sess.revoked { return None; }
        sess.access_token = grant.access_token.clone();
        sess.refresh_token = grant.refresh_token.clone();
        sess.access_expires_at = expires_at(now, grant.expires_in);
        Some(sess.clone())
    }

    pub fn revoke(&self, sid: &str) -> bool {
        let mut reg = self.inner.write();
        match reg.sessions.get_mut(sid) {
            Some(s) if !s.revoked => { s.revoked = true; true }
            _ => false,
        }
    }

    pub fn revoke_user(&self, user_id: &str) -> usize {
        self.revoke_user_except(user_id, None)
    }

    /// Revoke all of a user's sessions but `keep`. Returns how many were revoked.
    pub fn revoke_user_except(&self, user_id: &str, keep: Option<&str>) -> usize {
        let mut count = 0usize;
        let mut reg = self.inner.write();
        let sids: Vec<SessionId> = reg.by_user.get(user_id).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        for sid in sids {
            if Some(sid.as_str()) == keep { continue; }
            if let Some(s) = reg.sessions.get_mut(&sid) {
                if !s.revoked { s.revoked = true; count += 1; }
            }
        }
        tprintln!("session.revoke user={} count={}", user_id, count);
        count
    }

    /// Sessions of `user_id` that are still usable.
    pub fn active_for_user(&self, user_id: &str) -> usize {
        let reg = self.inner.read();
        reg.by_user
            .get(user_id)
            .map(|set| set.iter().filter(|sid| reg.sessions.get(*sid).map(|s| !s.revoked).unwrap_or(false)).count())
            .unwrap_or(0)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Drop revoked and idle-expired sessions.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let limit = self.idle_limit();
        let mut reg = self.inner.write();
        let dead: Vec<SessionId> = reg
            .sessions
            .values()
            .filter(|s| s.revoked || now - s.last_seen > limit)
            .map(|s| s.session_id.clone())
            .collect();
        for sid in &dead {
            reg.remove(sid);
        }
        dead.len()
    }

    pub fn len(&self) -> usize { self.inner.read().sessions.len() }

    pub fn is_empty(&self) -> bool { self.inner.read().sessions.is_empty() }
}
