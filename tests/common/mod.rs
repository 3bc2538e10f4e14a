//! Shared harness: a fake auth platform and a cookie-tracking HTTP client.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap as AxHeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{post, put};
use axum::{Json, Router};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use almoner::config::Config;
use almoner::server::{self, AppState};

pub const UA: &str = "Mozilla/5.0 (almoner integration tests)";

#[derive(Default)]
pub struct FakePlatform {
    /// email -> (password, user id)
    pub users: Mutex<HashMap<String, (String, String)>>,
    /// user id -> role row returned by get_user_roles
    pub roles: Mutex<HashMap<String, Value>>,
    /// user id -> access token lifetime override
    pub expires_in: Mutex<HashMap<String, i64>>,
    /// Live refresh tokens -> (user id, email); each is accepted once.
    pub refresh_tokens: Mutex<HashMap<String, (String, String)>>,
    pub role_calls: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub logout_calls: AtomicU32,
    pub fail_roles: AtomicBool,
    pub last_password: Mutex<Option<String>>,
}

impl FakePlatform {
    pub fn add_user(&self, email: &str, password: &str, user_id: &str, roles: Value) {
        self.users.lock().insert(email.to_string(), (password.to_string(), user_id.to_string()));
        self.roles.lock().insert(user_id.to_string(), roles);
    }

    pub fn role_calls(&self) -> u32 { self.role_calls.load(Ordering::SeqCst) }

    fn grant(&self, user_id: &str, email: &str) -> Value {
        let expires = self.expires_in.lock().get(user_id).copied().unwrap_or(3600);
        let refresh_token = format!("rt-{}-{}", user_id, uuid::Uuid::new_v4());
        self.refresh_tokens.lock().insert(refresh_token.clone(), (user_id.to_string(), email.to_string()));
        json!({
            "access_token": format!("at-{}-{}", user_id, uuid::Uuid::new_v4()),
            "refresh_token": refresh_token,
            "expires_in": expires,
            "token_type": "bearer",
            "user": {"id": user_id, "email": email}
        })
    }
}

type Shared = Arc<FakePlatform>;

/// Consume a refresh token; reuse is rejected like a rotating platform does.
fn user_for_refresh(p: &FakePlatform, refresh_token: &str) -> Option<(String, String)> {
    p.refresh_tokens.lock().remove(refresh_token)
}

async fn token(State(p): State<Shared>, Query(q): Query<HashMap<String, String>>, Json(body): Json<Value>) -> impl IntoResponse {
    match q.get("grant_type").map(|s| s.as_str()) {
        Some("password") => {
            let email = body["email"].as_str().unwrap_or_default().to_string();
            let password = body["password"].as_str().unwrap_or_default();
            let found = p.users.lock().get(&email).cloned();
            match found {
                Some((pw, uid)) if pw == password => (StatusCode::OK, Json(p.grant(&uid, &email))),
                _ => (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant", "error_description": "Invalid login credentials"}))),
            }
        }
        Some("refresh_token") => {
            p.refresh_calls.fetch_add(1, Ordering::SeqCst);
            // Slow enough for concurrent requests to overlap
            tokio::time::sleep(Duration::from_millis(50)).await;
            let rt = body["refresh_token"].as_str().unwrap_or_default();
            match user_for_refresh(&p, rt) {
                Some((uid, email)) => {
                    // Refreshed tokens get a normal lifetime
                    p.expires_in.lock().remove(&uid);
                    (StatusCode::OK, Json(p.grant(&uid, &email)))
                }
                None => (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))),
            }
        }
        _ => (StatusCode::BAD_REQUEST, Json(json!({"error": "unsupported_grant_type"}))),
    }
}

async fn signup(State(p): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let email = body["email"].as_str().unwrap_or_default().to_string();
    let password = body["password"].as_str().unwrap_or_default().to_string();
    if password.len() < 6 {
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"msg": "Password should be at least 6 characters"})));
    }
    let uid = format!("user-{}", uuid::Uuid::new_v4());
    p.add_user(&email, &password, &uid, json!({"is_viewer": true}));
    if email.starts_with("confirm") {
        (StatusCode::OK, Json(json!({"id": uid, "email": email, "confirmation_sent_at": "2026-01-01T00:00:00Z"})))
    } else {
        (StatusCode::OK, Json(p.grant(&uid, &email)))
    }
}

fn bearer(headers: &AxHeaderMap) -> Option<String> {
    headers.get("authorization")?.to_str().ok()?.strip_prefix("Bearer ").map(|s| s.to_string())
}

async fn update_user(State(p): State<Shared>, headers: AxHeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    if bearer(&headers).is_none() {
        return (StatusCode::UNAUTHORIZED, Json(json!({"msg": "missing token"})));
    }
    *p.last_password.lock() = body["password"].as_str().map(|s| s.to_string());
    (StatusCode::OK, Json(json!({"id": "updated-user"})))
}

async fn logout(State(p): State<Shared>) -> impl IntoResponse {
    p.logout_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn get_user_roles(State(p): State<Shared>, headers: AxHeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    p.role_calls.fetch_add(1, Ordering::SeqCst);
    if bearer(&headers).as_deref() != Some("service") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "service key required"})));
    }
    if p.fail_roles.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"message": "database unavailable"})));
    }
    let uid = body["p_user_id"].as_str().unwrap_or_default();
    let row = p.roles.lock().get(uid).cloned().unwrap_or_else(|| json!({}));
    (StatusCode::OK, Json(json!([row])))
}

pub fn fake_router(p: Shared) -> Router {
    Router::new()
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/signup", post(signup))
        .route("/auth/v1/user", put(update_user))
        .route("/auth/v1/logout", post(logout))
        .route("/rest/v1/rpc/get_user_roles", post(get_user_roles))
        .with_state(p)
}

pub struct Harness {
    pub base: String,
    pub platform: Shared,
    pub state: AppState,
}

async fn bind_ephemeral() -> (tokio::net::TcpListener, SocketAddr) {
    let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind 127.0.0.1:0");
    let addr = l.local_addr().expect("local addr");
    (l, addr)
}

pub async fn start() -> Harness {
    let platform: Shared = Arc::new(FakePlatform::default());
    let (pl, paddr) = bind_ephemeral().await;
    let router = fake_router(platform.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(pl, router).await { eprintln!("fake platform error: {e:?}"); }
    });

    let cfg = Config {
        backend_url: format!("http://{}", paddr),
        anon_key: "anon".into(),
        service_key: "service".into(),
        cookie_secret: b"integration-test-cookie-secret!!".to_vec(),
        cookie_secure: false,
        retry_base: Duration::from_millis(1),
        ..Config::default()
    };
    let state = AppState::new(cfg).expect("app state");
    let (l, addr) = bind_ephemeral().await;
    let st = state.clone();
    tokio::spawn(async move {
        if let Err(e) = server::serve(l, st).await { eprintln!("server task error: {e:?}"); }
    });
    Harness { base: format!("http://{}", addr), platform, state }
}

/// Minimal browser stand-in: keeps cookies from Set-Cookie and the CSRF token.
#[derive(Clone)]
pub struct Client {
    base: String,
    http: reqwest::Client,
    pub cookies: HashMap<String, String>,
    pub csrf: Option<String>,
    pub user_agent: String,
}

pub struct Reply {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Reply {
    pub fn code(&self) -> &str { self.body["code"].as_str().unwrap_or_default() }
    pub fn rotated(&self) -> Option<String> {
        self.headers.get("x-csrf-rotated").and_then(|v| v.to_str().ok()).map(|s| s.to_string())
    }
}

impl Client {
    pub fn new(h: &Harness) -> Self {
        Self::with_user_agent(h, UA)
    }

    pub fn with_user_agent(h: &Harness, ua: &str) -> Self {
        Self {
            base: h.base.clone(),
            http: reqwest::Client::new(),
            cookies: HashMap::new(),
            csrf: None,
            user_agent: ua.to_string(),
        }
    }

    fn absorb(&mut self, headers: &HeaderMap) {
        for val in headers.get_all(reqwest::header::SET_COOKIE).iter() {
            let Ok(s) = val.to_str() else { continue; };
            let nv = s.split(';').next().unwrap_or("").trim();
            let Some((name, value)) = nv.split_once('=') else { continue; };
            if s.contains("Max-Age=0") {
                self.cookies.remove(name);
            } else {
                self.cookies.insert(name.to_string(), value.to_string());
            }
        }
        if let Some(t) = headers.get("x-csrf-rotated").and_then(|v| v.to_str().ok()) {
            self.csrf = Some(t.to_string());
        }
    }

    fn request_headers(&self, with_csrf: bool) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("user-agent", HeaderValue::from_str(&self.user_agent).unwrap());
        if !self.cookies.is_empty() {
            let cookie = self.cookies.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join("; ");
            h.insert("cookie", HeaderValue::from_str(&cookie).unwrap());
        }
        if with_csrf {
            if let Some(t) = &self.csrf {
                h.insert("x-csrf-token", HeaderValue::from_str(t).unwrap());
            }
        }
        h
    }

    async fn send(&mut self, req: reqwest::RequestBuilder) -> Reply {
        let resp = req.send().await.expect("request");
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        self.absorb(&headers);
        let text = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Reply { status, headers, body }
    }

    pub async fn get(&mut self, path: &str) -> Reply {
        let req = self.http.get(format!("{}{}", self.base, path)).headers(self.request_headers(false));
        self.send(req).await
    }

    /// Fetch the CSRF token the way the browser app does.
    pub async fn fetch_csrf(&mut self) -> String {
        let r = self.get("/auth/csrf").await;
        assert_eq!(r.status, 200, "csrf fetch failed: {}", r.body);
        let t = r.body["csrf"].as_str().expect("csrf in body").to_string();
        self.csrf = Some(t.clone());
        t
    }

    pub async fn post(&mut self, path: &str, body: Value) -> Reply {
        let req = self.http.post(format!("{}{}", self.base, path)).headers(self.request_headers(true)).json(&body);
        self.send(req).await
    }

    pub async fn post_without_csrf(&mut self, path: &str, body: Value) -> Reply {
        let req = self.http.post(format!("{}{}", self.base, path)).headers(self.request_headers(false)).json(&body);
        self.send(req).await
    }

    pub async fn delete(&mut self, path: &str) -> Reply {
        let req = self.http.delete(format!("{}{}", self.base, path)).headers(self.request_headers(true));
        self.send(req).await
    }

    pub async fn sign_in(&mut self, email: &str, password: &str) -> Reply {
        if self.csrf.is_none() {
            self.fetch_csrf().await;
        }
        self.post("/auth/sign-in", json!({"email": email, "password": password})).await
    }
}
