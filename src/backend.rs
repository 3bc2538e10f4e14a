//!
//! Auth platform client
//! --------------------
//! Thin HTTP client for the managed backend platform: password and refresh-token
//! grants, sign-up, password change, logout, and database RPC calls. Sessions,
//! row-level security and RPC dispatch live on the platform; this module only
//! speaks its HTTP surface.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::identity::{RoleSet, RoleSource};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const ROLES_RPC: &str = "get_user_roles";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The platform refused the credentials, token or payload (4xx).
    #[error("platform rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("platform returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected platform response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PlatformUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Tokens returned by the password and refresh-token grants.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the access token in seconds.
    #[serde(default = "TokenGrant::default_expires_in")]
    pub expires_in: i64,
    pub user: PlatformUser,
}

impl TokenGrant {
    fn default_expires_in() -> i64 { 3600 }
}

#[derive(Debug, Clone)]
pub enum SignUpOutcome {
    /// The platform signed the user in straight away.
    Session(TokenGrant),
    /// Account created; the platform requires email confirmation first.
    ConfirmationRequired(PlatformUser),
}

#[derive(Clone)]
pub struct BackendClient {
    base: String,
    anon_key: String,
    service_key: String,
    client: reqwest::Client,
}

fn error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        for k in ["error_description", "msg", "message", "error"] {
            if let Some(s) = v.get(k).and_then(|x| x.as_str()) {
                return s.to_string();
            }
        }
    }
    body.chars().take(200).collect()
}

impl BackendClient {
    pub fn new(base: &str, anon_key: &str, service_key: &str) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            service_key: service_key.to_string(),
            client,
        })
    }

    fn headers(&self, bearer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&self.anon_key) {
            headers.insert("apikey", v);
        }
        if let Some(token) = bearer {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, v);
            }
        }
        headers
    }

    async fn call(&self, method: Method, path: &str, bearer: Option<&str>, body: Option<Value>) -> Result<Value, BackendError> {
        let url = format!("{}{}", self.base, path);
        let mut req = self.client.request(method, &url).headers(self.headers(bearer));
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let message = error_message(&text);
            return Err(if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                BackendError::Rejected { status: status.as_u16(), message }
            } else {
                BackendError::Status { status: status.as_u16(), message }
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(v: Value) -> Result<T, BackendError> {
        serde_json::from_value(v).map_err(|e| BackendError::Decode(e.to_string()))
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<TokenGrant, BackendError> {
        let v = self
            .call(Method::POST, "/auth/v1/token?grant_type=password", None, Some(json!({"email": email, "password": password})))
            .await?;
        Self::decode(v)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, BackendError> {
        let v = self
            .call(Method::POST, "/auth/v1/token?grant_type=refresh_token", None, Some(json!({"refresh_token": refresh_token})))
            .await?;
        Self::decode(v)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, BackendError> {
        let v = self
            .call(Method::POST, "/auth/v1/signup", None, Some(json!({"email": email, "password": password})))
            .await?;
        if v.get("access_token").and_then(|t| t.as_str()).is_some() {
            return Ok(SignUpOutcome::Session(Self::decode(v)?));
        }
        // Without auto-confirm the platform answers with the user, bare or wrapped
        let user = match v.get("user") {
            Some(u) if !u.is_null() => u.clone(),
            _ => v,
        };
        Ok(SignUpOutcome::ConfirmationRequired(Self::decode(user)?))
    }

    pub async fn update_password(&self, access_token: &str, new_password: &str) -> Result<PlatformUser, BackendError> {
        let v = self
            .call(Method::PUT, "/auth/v1/user", Some(access_token), Some(json!({"password": new_password})))
            .await?;
        Self::decode(v)
    }

    pub async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        self.call(Method::POST, "/auth/v1/logout", Some(access_token), None).await?;
        Ok(())
    }

    /// Invoke a database function with the service key.
    pub async fn rpc(&self, function: &str, args: Value) -> Result<Value, BackendError> {
        let path = format!("/rest/v1/rpc/{}", urlencoding::encode(function));
        self.call(Method::POST, &path, Some(&self.service_key), Some(args)).await
    }
}

/// Accepts either a single row object or a one-row array, as RPCs may return both.
fn parse_role_rows(v: Value) -> Result<RoleSet, BackendError> {
    let row = match v {
        Value::Array(mut rows) => {
            if rows.is_empty() { return Ok(RoleSet::default()); }
            rows.swap_remove(0)
        }
        Value::Null => return Ok(RoleSet::default()),
        other => other,
    };
    serde_json::from_value(row).map_err(|e| BackendError::Decode(format!("role row: {}", e)))
}

#[async_trait]
impl RoleSource for BackendClient {
    async fn fetch_roles(&self, user_id: &str) -> Result<RoleSet, BackendError> {
        let v = self.rpc(ROLES_RPC, json!({"p_user_id": user_id})).await?;
        parse_role_rows(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_rows_accept_object_array_and_null() {
        let one = parse_role_rows(json!({"is_admin": false, "is_donor": true})).unwrap();
        assert!(one.is_donor);
        let arr = parse_role_rows(json!([{"is_member": true}])).unwrap();
        assert!(arr.is_member);
        assert_eq!(parse_role_rows(json!([])).unwrap(), RoleSet::default());
        assert_eq!(parse_role_rows(Value::Null).unwrap(), RoleSet::default());
        assert!(parse_role_rows(json!("nope")).is_err());
    }

    #[test]
    fn error_message_prefers_description_fields() {
        assert_eq!(error_message(r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#), "Invalid login credentials");
        assert_eq!(error_message(r#"{"msg":"User already registered"}"#), "User already registered");
        assert_eq!(error_message("plain text"), "plain text");
    }

    #[test]
    fn token_grant_defaults_expiry() {
        let g: TokenGrant = serde_json::from_value(json!({
            "access_token": "a", "refresh_token": "r", "user": {"id": "u1"}
        })).unwrap();
        assert_eq!(g.expires_in, 3600);
        assert_eq!(g.user.email, None);
    }
}
