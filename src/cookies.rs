//! Cookie names, request cookie parsing and `Set-Cookie` construction.

use axum::http::{HeaderMap, HeaderValue};

use crate::error::AppError;

pub const SESSION_COOKIE: &str = "almoner_session";
pub const CSRF_COOKIE: &str = "almoner_csrf";
pub const ROLE_COOKIE: &str = "almoner_role";

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_ROTATED_HEADER: &str = "x-csrf-rotated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
        }
    }
}

pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie in headers.get_all(axum::http::header::COOKIE).iter() {
        let Ok(s) = cookie.to_str() else { continue; };
        for part in s.split(';') {
            let p = part.trim();
            if let Some((k, v)) = p.split_once('=') {
                if k == name && !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

/// Builds `Set-Cookie` values with the deployment's `Secure` setting.
#[derive(Debug, Clone, Copy)]
pub struct CookieJar {
    pub secure: bool,
}

impl CookieJar {
    pub fn new(secure: bool) -> Self { Self { secure } }

    fn render(&self, name: &str, value: &str, same_site: SameSite, max_age: Option<i64>) -> Result<HeaderValue, AppError> {
        let mut s = format!("{}={}; HttpOnly; SameSite={}; Path=/", name, value, same_site.as_str());
        if self.secure { s.push_str("; Secure"); }
        if let Some(age) = max_age {
            s.push_str(&format!("; Max-Age={}", age));
        }
        HeaderValue::from_str(&s).map_err(|e| AppError::internal("cookie_encoding".to_string(), e.to_string()))
    }

    pub fn session(&self, sid: &str) -> Result<HeaderValue, AppError> {
        self.render(SESSION_COOKIE, sid, SameSite::Lax, None)
    }

    pub fn csrf(&self, token: &str) -> Result<HeaderValue, AppError> {
        self.render(CSRF_COOKIE, token, SameSite::Strict, None)
    }

    pub fn active_role(&self, signed: &str) -> Result<HeaderValue, AppError> {
        self.render(ROLE_COOKIE, signed, SameSite::Lax, None)
    }

    /// Expire `name` on the client.
    pub fn clear(&self, name: &str) -> Result<HeaderValue, AppError> {
        let mut s = format!("{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0; HttpOnly; Path=/", name);
        if self.secure { s.push_str("; Secure"); }
        HeaderValue::from_str(&s).map_err(|e| AppError::internal("cookie_encoding".to_string(), e.to_string()))
    }
}
