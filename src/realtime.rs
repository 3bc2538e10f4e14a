//!
//! Change-feed invalidation
//! ------------------------
//! Subscribes to the platform's realtime feed (Phoenix channel JSON over
//! WebSocket) for the roles and sessions tables, and turns row changes into role
//! cache invalidations and session revocations.
//!
//! Responsibilities:
//! - Parse both the legacy change payload and the `postgres_changes` payload.
//! - Map roles-table changes to a per-user cache invalidation, or a full clear
//!   when the row carries no user id.
//! - Map sessions-table deletes/revocations to revoking the user's sessions.
//! - Keep the socket alive with heartbeats and reconnect with backoff; the cache
//!   is cleared after every reconnect since events may have been missed.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::identity::{RoleCache, SessionManager};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Other,
}

impl ChangeKind {
    fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => ChangeKind::Insert,
            "UPDATE" => ChangeKind::Update,
            "DELETE" => ChangeKind::Delete,
            _ => ChangeKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub user_id: Option<String>,
    /// Row was deleted or now carries a revocation marker.
    pub revoked: bool,
}

fn user_id_of(row: Option<&Value>) -> Option<String> {
    let v = row?.get("user_id")?;
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_revoked_row(row: Option<&Value>) -> bool {
    let Some(r) = row else { return false; };
    r.get("revoked").and_then(|v| v.as_bool()).unwrap_or(false)
        || r.get("revoked_at").map(|v| !v.is_null()).unwrap_or(false)
}

/// Extract a row change from a feed message; `None` for replies, heartbeats
/// and anything else that is not a table change.
pub fn parse_change(msg: &Value) -> Option<ChangeEvent> {
    let payload = msg.get("payload")?;
    let body = payload.get("data").filter(|d| d.is_object()).unwrap_or(payload);
    let table = body.get("table")?.as_str()?.to_string();
    let kind = body
        .get("type")
        .or_else(|| body.get("eventType"))
        .and_then(|v| v.as_str())
        .map(ChangeKind::parse)
        .unwrap_or(ChangeKind::Other);
    let record = body.get("record").filter(|r| !r.is_null());
    let old_record = body.get("old_record").filter(|r| !r.is_null());
    let user_id = user_id_of(record).or_else(|| user_id_of(old_record));
    let revoked = kind == ChangeKind::Delete || is_revoked_row(record);
    Some(ChangeEvent { table, kind, user_id, revoked })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Ignored,
    User { user_id: String, sessions_revoked: usize },
    ClearedAll { entries: usize },
}

/// Applies change events to the role cache and session registry.
#[derive(Clone)]
pub struct Invalidator {
    pub roles_table: String,
    pub sessions_table: String,
    pub cache: RoleCache,
    pub sessions: SessionManager,
}

impl Invalidator {
    pub fn apply(&self, ev: &ChangeEvent) -> Invalidation {
        let is_roles = ev.table == self.roles_table;
        let is_sessions = ev.table == self.sessions_table;
        if !is_roles && !is_sessions {
            return Invalidation::Ignored;
        }
        let Some(user_id) = ev.user_id.clone() else {
            let entries = self.cache.clear();
            info!(target: "realtime", table = %ev.table, entries, "change without user id; role cache cleared");
            return Invalidation::ClearedAll { entries };
        };
        self.cache.invalidate(&user_id);
        let sessions_revoked = if is_sessions && ev.revoked { self.sessions.revoke_user(&user_id) } else { 0 };
        debug!(target: "realtime", table = %ev.table, user_id = %user_id, sessions_revoked, "invalidated");
        Invalidation::User { user_id, sessions_revoked }
    }

    /// Parse and apply one raw text frame.
    pub fn handle_text(&self, text: &str) -> Invalidation {
        match serde_json::from_str::<Value>(text) {
            Ok(v) => match parse_change(&v) {
                Some(ev) => self.apply(&ev),
                None => Invalidation::Ignored,
            },
            Err(e) => {
                debug!(target: "realtime", error = %e, "unparseable frame ignored");
                Invalidation::Ignored
            }
        }
    }
}

pub fn join_message(table: &str, msg_ref: u64) -> Value {
    json!({
        "topic": format!("realtime:public:{}", table),
        "event": "phx_join",
        "payload": {"config": {"postgres_changes": [{"event": "*", "schema": "public", "table": table}]}},
        "ref": msg_ref.to_string(),
    })
}

pub fn heartbeat_message(msg_ref: u64) -> Value {
    json!({"topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": msg_ref.to_string()})
}

pub fn socket_url(base: &str, api_key: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}apikey={}&vsn=1.0.0", base, sep, urlencoding::encode(api_key))
}

async fn run_once(url: &str, inv: &Invalidator) -> anyhow::Result<()> {
    let (stream, _resp) = tokio_tungstenite::connect_async(url).await?;
    let (mut sink, mut source) = stream.split();
    let mut msg_ref: u64 = 0;
    for table in [&inv.roles_table, &inv.sessions_table] {
        msg_ref += 1;
        sink.send(Message::Text(join_message(table, msg_ref).to_string())).await?;
    }
    info!(target: "realtime", tables = ?[&inv.roles_table, &inv.sessions_table], "subscribed to change feed");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                msg_ref += 1;
                sink.send(Message::Text(heartbeat_message(msg_ref).to_string())).await?;
            }
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => { inv.handle_text(&text); }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

/// Keep a subscription alive until the task is aborted.
pub fn spawn_listener(url: String, api_key: String, inv: Invalidator) -> JoinHandle<()> {
    tokio::spawn(async move {
        let full_url = socket_url(&url, &api_key);
        let mut backoff = RECONNECT_MIN;
        loop {
            let started = tokio::time::Instant::now();
            match run_once(&full_url, &inv).await {
                Ok(()) => warn!(target: "realtime", "change feed closed"),
                Err(e) => warn!(target: "realtime", error = %e, "change feed error"),
            }
            // Events may have been missed while disconnected
            inv.cache.clear();
            if started.elapsed() > RECONNECT_MAX {
                backoff = RECONNECT_MIN;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PlatformUser, TokenGrant};
    use crate::identity::{Role, RoleSet};

    fn invalidator() -> Invalidator {
        Invalidator {
            roles_table: "user_roles".into(),
            sessions_table: "user_sessions".into(),
            cache: RoleCache::new(Duration::from_secs(300), Duration::from_secs(30)),
            sessions: SessionManager::default(),
        }
    }

    fn grant(user: &str) -> TokenGrant {
        TokenGrant {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_in: 3600,
            user: PlatformUser { id: user.into(), email: None },
        }
    }

    #[test]
    fn parses_legacy_and_postgres_changes_shapes() {
        let legacy = json!({
            "topic": "realtime:public:user_roles", "event": "UPDATE",
            "payload": {"type": "UPDATE", "table": "user_roles", "schema": "public",
                        "record": {"user_id": "u1", "is_admin": true}, "old_record": {"user_id": "u1"}},
            "ref": null
        });
        let ev = parse_change(&legacy).unwrap();
        assert_eq!(ev.table, "user_roles");
        assert_eq!(ev.kind, ChangeKind::Update);
        assert_eq!(ev.user_id.as_deref(), Some("u1"));
        assert!(!ev.revoked);

        let modern = json!({
            "topic": "realtime:public:user_sessions", "event": "postgres_changes",
            "payload": {"ids": [1], "data": {"table": "user_sessions", "type": "DELETE",
                        "record": null, "old_record": {"user_id": "u2"}}}
        });
        let ev = parse_change(&modern).unwrap();
        assert_eq!(ev.kind, ChangeKind::Delete);
        assert_eq!(ev.user_id.as_deref(), Some("u2"));
        assert!(ev.revoked);
    }

    #[test]
    fn replies_and_heartbeats_are_not_changes() {
        let reply = json!({"topic": "phoenix", "event": "phx_reply", "payload": {"status": "ok", "response": {}}, "ref": "1"});
        assert!(parse_change(&reply).is_none());
        assert!(parse_change(&json!({"event": "heartbeat"})).is_none());
    }

    #[test]
    fn role_change_invalidates_only_that_user() {
        let inv = invalidator();
        inv.cache.insert("u1", RoleSet::from_roles([Role::Member]));
        inv.cache.insert("u2", RoleSet::from_roles([Role::Donor]));
        let ev = ChangeEvent { table: "user_roles".into(), kind: ChangeKind::Update, user_id: Some("u1".into()), revoked: false };
        assert_eq!(inv.apply(&ev), Invalidation::User { user_id: "u1".into(), sessions_revoked: 0 });
        assert!(inv.cache.get("u1").is_none());
        assert!(inv.cache.get("u2").is_some());
    }

    #[test]
    fn change_without_user_clears_everything() {
        let inv = invalidator();
        inv.cache.insert("u1", RoleSet::default());
        inv.cache.insert("u2", RoleSet::default());
        let frame = r#"{"payload":{"table":"user_roles","type":"TRUNCATE"}}"#;
        assert_eq!(inv.handle_text(frame), Invalidation::ClearedAll { entries: 2 });
        assert!(inv.cache.is_empty());
    }

    #[test]
    fn session_revocation_revokes_user_sessions() {
        let inv = invalidator();
        inv.sessions.issue(&grant("u1"), None).unwrap();
        inv.sessions.issue(&grant("u1"), None).unwrap();
        inv.cache.insert("u1", RoleSet::default());
        let frame = r#"{"payload":{"table":"user_sessions","type":"UPDATE","record":{"user_id":"u1","revoked":true}}}"#;
        assert_eq!(inv.handle_text(frame), Invalidation::User { user_id: "u1".into(), sessions_revoked: 2 });
        assert_eq!(inv.sessions.active_for_user("u1"), 0);
        assert!(inv.cache.get("u1").is_none());

        // A plain last-seen update only drops the cache entry
        inv.sessions.issue(&grant("u1"), None).unwrap();
        let frame = r#"{"payload":{"table":"user_sessions","type":"UPDATE","record":{"user_id":"u1","revoked_at":null}}}"#;
        assert_eq!(inv.handle_text(frame), Invalidation::User { user_id: "u1".into(), sessions_revoked: 0 });
        assert_eq!(inv.sessions.active_for_user("u1"), 1);
    }

    #[test]
    fn other_tables_and_garbage_are_ignored() {
        let inv = invalidator();
        inv.cache.insert("u1", RoleSet::default());
        assert_eq!(inv.handle_text(r#"{"payload":{"table":"donations","type":"INSERT","record":{"user_id":"u1"}}}"#), Invalidation::Ignored);
        assert_eq!(inv.handle_text("not json"), Invalidation::Ignored);
        assert!(inv.cache.get("u1").is_some());
    }

    #[test]
    fn socket_url_appends_key() {
        assert_eq!(socket_url("wss://rt.example/socket", "k y"), "wss://rt.example/socket?apikey=k%20y&vsn=1.0.0");
        assert_eq!(socket_url("ws://h/s?x=1", "k"), "ws://h/s?x=1&apikey=k&vsn=1.0.0");
        assert_eq!(join_message("user_roles", 1)["topic"], "realtime:public:user_roles");
    }
}
