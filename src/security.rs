//! Token primitives: CSRF tokens, constant-time token matching and HMAC-signed
//! cookie values.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// CSRF tokens carry 256 bits of entropy.
pub const CSRF_TOKEN_BYTES: usize = 32;

/// Per-process key for token comparison; never leaves memory.
static COMPARE_KEY: Lazy<[u8; 32]> = Lazy::new(|| {
    let mut k = [0u8; 32];
    if getrandom::getrandom(&mut k).is_err() {
        // A fixed key still gives constant-time comparison, only the blinding is lost.
        k = *b"almoner-token-compare-fixed-key!";
    }
    k
});

pub fn random_token(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!("os rng unavailable: {}", e))?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

pub fn generate_csrf_token() -> Result<String> {
    random_token(CSRF_TOKEN_BYTES)
}

/// Compare two tokens without leaking the position of the first differing byte.
///
/// Both sides are MACed under a process key and the tags are compared with
/// `verify_slice`, so timing depends on neither content nor length.
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    let tag = |v: &str| -> Option<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&COMPARE_KEY[..]).ok()?;
        mac.update(v.as_bytes());
        Some(mac.finalize().into_bytes().to_vec())
    };
    let Some(expected_tag) = tag(expected) else { return false; };
    let Ok(mut mac) = HmacSha256::new_from_slice(&COMPARE_KEY[..]) else { return false; };
    mac.update(provided.as_bytes());
    mac.verify_slice(&expected_tag).is_ok()
}

/// Outcome of checking a request's CSRF cookie against its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfCheck {
    Valid,
    Missing,
    Mismatch,
}

pub fn check_csrf(cookie_token: Option<&str>, header_token: Option<&str>) -> CsrfCheck {
    match (cookie_token, header_token) {
        (Some(c), Some(h)) if !c.is_empty() && !h.is_empty() => {
            if tokens_match(c, h) { CsrfCheck::Valid } else { CsrfCheck::Mismatch }
        }
        _ => CsrfCheck::Missing,
    }
}

/// Sign `payload` as `<payload>.<sig>` with HMAC-SHA256 under `secret`.
pub fn sign_value(secret: &[u8], payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| anyhow!(e.to_string()))?;
    mac.update(payload.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{}.{}", payload, sig))
}

/// Verify a value produced by [`sign_value`] and return its payload.
pub fn verify_signed_value<'a>(secret: &[u8], signed: &'a str) -> Option<&'a str> {
    let (payload, sig_part) = signed.rsplit_once('.')?;
    let sig = URL_SAFE_NO_PAD.decode(sig_part).ok()?;
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&sig).ok()?;
    Some(payload)
}

/// Device fingerprint recorded with a session: hex SHA-256 of the User-Agent.
pub fn user_agent_hash(user_agent: Option<&str>) -> String {
    let mut h = Sha256::new();
    h.update(user_agent.unwrap_or("").as_bytes());
    hex::encode(h.finalize())
}
