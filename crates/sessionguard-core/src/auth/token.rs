//! Bearer token type and client-side claims inspection.
//!
//! Tokens are JWT-shaped (`header.payload.signature`). The payload is decoded
//! locally to read expiry and identity claims; the signature is never checked
//! here, that is the server's job.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tokens within this many seconds of expiry are already treated as expired.
pub const EXPIRY_GRACE_SECS: i64 = 30;

/// Window in which a still-valid token is refreshed ahead of use (5 minutes).
pub const REFRESH_WINDOW_SECS: i64 = 5 * 60;

/// Opaque bearer token issued by the server.
///
/// Never mutated; a refresh produces a new `Token` that replaces the old one.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the embedded claims.
    pub fn claims(&self) -> Result<Claims, DecodeError> {
        decode(self.as_str())
    }
}

// Keep tokens out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail: String = self
            .0
            .chars()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        write!(f, "Token(..{})", tail)
    }
}

impl From<String> for Token {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Token {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("token is not made of three dot-separated segments")]
    Malformed,

    #[error("token payload is not valid base64url: {0}")]
    Base64(String),

    #[error("token payload is not a valid claims object: {0}")]
    Claims(String),

    #[error("token expiry is out of range")]
    ExpiryOutOfRange,
}

/// Claims the client cares about. Unknown claims are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    #[serde(rename = "sub", default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(rename = "iat", default)]
    pub issued_at: Option<i64>,
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

impl Claims {
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    pub fn issued_at_utc(&self) -> Option<DateTime<Utc>> {
        self.issued_at.and_then(|iat| DateTime::from_timestamp(iat, 0))
    }
}

/// Decode a token's payload segment into [`Claims`].
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
        _ => return Err(DecodeError::Malformed),
    };

    // Some issuers pad their segments even though JWT says not to.
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    let claims: Claims =
        serde_json::from_slice(&bytes).map_err(|e| DecodeError::Claims(e.to_string()))?;

    if claims.expires_at_utc().is_none() {
        return Err(DecodeError::ExpiryOutOfRange);
    }
    Ok(claims)
}

/// True if the token cannot be decoded or expires within the grace window.
///
/// Malformed tokens fail closed.
pub fn is_expired(token: &Token, now: DateTime<Utc>) -> bool {
    match token.claims().ok().and_then(|c| c.expires_at_utc()) {
        Some(expires_at) => now + Duration::seconds(EXPIRY_GRACE_SECS) >= expires_at,
        None => true,
    }
}

/// True if the token is still valid but expires in less than `window`.
pub fn expires_within(token: &Token, now: DateTime<Utc>, window: Duration) -> bool {
    match token.claims().ok().and_then(|c| c.expires_at_utc()) {
        Some(expires_at) => {
            let remaining = expires_at - now;
            remaining > Duration::zero() && remaining < window
        }
        None => false,
    }
}

/// True if the token should be refreshed before it is attached to a request.
pub fn needs_refresh(token: &Token, now: DateTime<Utc>) -> bool {
    is_expired(token, now) || expires_within(token, now, Duration::seconds(REFRESH_WINDOW_SECS))
}

/// Build an unsigned token carrying the given claims. Used by tests and by
/// tooling that needs a syntactically valid token.
pub fn encode_unsigned(subject: &str, role: Option<&str>, issued_at: i64, expires_at: i64) -> Token {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let mut claims = serde_json::json!({
        "sub": subject,
        "iat": issued_at,
        "exp": expires_at,
    });
    if let Some(role) = role {
        claims["role"] = serde_json::Value::String(role.to_string());
    }
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    Token(format!("{}.{}.", header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_expiring_in(now: DateTime<Utc>, secs: i64) -> Token {
        encode_unsigned("user-1", Some("admin"), now.timestamp() - 60, now.timestamp() + secs)
    }

    #[test]
    fn test_decode_claims() {
        let token = encode_unsigned("user-1", Some("admin"), 1_700_000_000, 1_700_003_600);
        let claims = token.claims().expect("claims should decode");
        assert_eq!(claims.subject.as_deref(), Some("user-1"));
        assert_eq!(claims.role.as_deref(), Some("admin"));
        assert_eq!(claims.issued_at, Some(1_700_000_000));
        assert_eq!(claims.expires_at, 1_700_003_600);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(decode(""), Err(DecodeError::Malformed));
        assert_eq!(decode("abc"), Err(DecodeError::Malformed));
        assert_eq!(decode("a..c"), Err(DecodeError::Malformed));
        assert_eq!(decode("a.b.c.d"), Err(DecodeError::Malformed));
        assert!(matches!(decode("a.!!!.c"), Err(DecodeError::Base64(_))));

        // Valid base64 but not a claims object
        let payload = URL_SAFE_NO_PAD.encode(b"[1,2,3]");
        assert!(matches!(decode(&format!("h.{}.s", payload)), Err(DecodeError::Claims(_))));

        // Claims without exp
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#);
        assert!(matches!(decode(&format!("h.{}.s", payload)), Err(DecodeError::Claims(_))));
    }

    #[test]
    fn test_decode_tolerates_padding() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(br#"{"exp": 1700000000}"#);
        let claims = decode(&format!("h.{}.s", payload)).expect("padded payload should decode");
        assert_eq!(claims.expires_at, 1_700_000_000);
    }

    #[test]
    fn test_is_expired_grace_window() {
        let now = Utc::now();
        assert!(is_expired(&token_expiring_in(now, -10), now));
        assert!(is_expired(&token_expiring_in(now, 0), now));
        assert!(is_expired(&token_expiring_in(now, 29), now));
        assert!(!is_expired(&token_expiring_in(now, 31), now));
        assert!(!is_expired(&token_expiring_in(now, 3600), now));
    }

    #[test]
    fn test_is_expired_boundary_is_inclusive() {
        // exp == now + 30s exactly counts as expired
        let now = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
        let token = encode_unsigned("u", None, 1_699_999_000, 1_700_000_030);
        assert!(is_expired(&token, now));
        let token = encode_unsigned("u", None, 1_699_999_000, 1_700_000_031);
        assert!(!is_expired(&token, now));
    }

    #[test]
    fn test_malformed_token_fails_closed() {
        let now = Utc::now();
        assert!(is_expired(&Token::new("garbage"), now));
        assert!(needs_refresh(&Token::new("garbage"), now));
        assert!(!expires_within(&Token::new("garbage"), now, Duration::minutes(5)));
    }

    #[test]
    fn test_expires_within() {
        let now = Utc::now();
        let window = Duration::minutes(5);
        assert!(expires_within(&token_expiring_in(now, 120), now, window));
        assert!(!expires_within(&token_expiring_in(now, 600), now, window));
        assert!(!expires_within(&token_expiring_in(now, -5), now, window));
    }

    #[test]
    fn test_needs_refresh() {
        let now = Utc::now();
        assert!(needs_refresh(&token_expiring_in(now, 120), now));
        assert!(needs_refresh(&token_expiring_in(now, 10), now));
        assert!(!needs_refresh(&token_expiring_in(now, 3600), now));
    }

    #[test]
    fn test_debug_hides_token() {
        let token = Token::new("secret-part.payload.signature");
        let shown = format!("{:?}", token);
        assert!(!shown.contains("secret-part"));
        assert!(shown.ends_with("nature)"));
    }
}
