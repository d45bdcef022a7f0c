//! OIDC browser session held entirely in a sealed cookie.
//!
//! The session is serialized to JSON and sealed with ChaCha20-Poly1305 under
//! a key derived from `ODIC_SESSION_SECRET`. The client only ever sees the
//! ciphertext, so every field read back out of a cookie that opens
//! successfully was written by this gateway.
//!
//! # Cookie Format
//!
//! ```text
//! <name>=base64url(nonce[12] || ciphertext || tag[16]); HttpOnly; SameSite=Lax; Path=/
//! ```

use axum::http::{HeaderMap, HeaderValue};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Browsers drop cookies larger than this, so refuse to emit them.
pub const MAX_COOKIE_BYTES: usize = 4096;

const NONCE_LEN: usize = 12;

/// Login state for one browser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Single-use CSRF token issued with the last authorization redirect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_state: Option<String>,
    /// Where to send the browser once the callback completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odic_restore_url: Option<String>,
    /// Provider access token; its presence marks the session as logged in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_email: Option<String>,
    /// Unix seconds of the successful callback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated_at: Option<i64>,
    /// Unix seconds after which the session must log in again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Session {
    /// A session is authenticated when it holds a non-empty token that has
    /// not passed its expiry.
    pub fn is_authenticated(&self, now: DateTime<Utc>) -> bool {
        let has_token = self.token.as_deref().is_some_and(|t| !t.is_empty());
        let expired = self
            .expires_at
            .is_some_and(|expires_at| now.timestamp() >= expires_at);

        has_token && !expired
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session cookie could not be decoded: {0}")]
    Decode(String),

    #[error("session could not be encoded: {0}")]
    Encode(String),

    #[error("session cookie exceeds {MAX_COOKIE_BYTES} bytes")]
    TooLarge,
}

/// Reads and writes sessions from request and response headers.
pub trait SessionCodec: Send + Sync {
    /// Load the session from the request's `Cookie` headers.
    ///
    /// A missing cookie yields an empty session; a cookie that is present but
    /// cannot be opened is an error.
    fn load(&self, headers: &HeaderMap) -> Result<Session, SessionError>;

    /// Produce the `Set-Cookie` value persisting `session`.
    fn store(&self, session: &Session) -> Result<HeaderValue, SessionError>;
}

/// [`SessionCodec`] sealing sessions with ChaCha20-Poly1305.
pub struct SealedCookieCodec {
    cipher: ChaCha20Poly1305,
    cookie_name: String,
    secure: bool,
    max_age_secs: Option<u64>,
}

impl SealedCookieCodec {
    /// Create a codec whose key is the SHA-256 digest of `secret`.
    pub fn new(secret: &str, cookie_name: impl Into<String>) -> Self {
        let key = Sha256::digest(secret.as_bytes());

        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            cookie_name: cookie_name.into(),
            secure: false,
            max_age_secs: None,
        }
    }

    /// Mark emitted cookies `Secure`.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Emit `Max-Age` so the browser drops the cookie with the session.
    pub fn max_age_secs(mut self, max_age_secs: Option<u64>) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    fn seal(&self, plaintext: &[u8]) -> Result<String, SessionError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(sealed))
    }

    fn open(&self, value: &str) -> Result<Vec<u8>, SessionError> {
        let sealed = BASE64
            .decode(value)
            .map_err(|e| SessionError::Decode(e.to_string()))?;

        if sealed.len() <= NONCE_LEN {
            return Err(SessionError::Decode("truncated cookie".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SessionError::Decode("authentication failed".to_string()))
    }
}

impl SessionCodec for SealedCookieCodec {
    fn load(&self, headers: &HeaderMap) -> Result<Session, SessionError> {
        let jar = CookieJar::from_headers(headers);
        let Some(cookie) = jar.get(&self.cookie_name) else {
            return Ok(Session::default());
        };

        let plaintext = self.open(cookie.value())?;
        serde_json::from_slice(&plaintext).map_err(|e| SessionError::Decode(e.to_string()))
    }

    fn store(&self, session: &Session) -> Result<HeaderValue, SessionError> {
        let plaintext =
            serde_json::to_vec(session).map_err(|e| SessionError::Encode(e.to_string()))?;
        let value = self.seal(&plaintext)?;

        let mut cookie = Cookie::build((self.cookie_name.clone(), value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure);
        if let Some(secs) = self.max_age_secs {
            cookie = cookie.max_age(time::Duration::seconds(
                i64::try_from(secs).unwrap_or(i64::MAX),
            ));
        }

        let header = cookie.build().to_string();

        if header.len() > MAX_COOKIE_BYTES {
            return Err(SessionError::TooLarge);
        }

        HeaderValue::from_str(&header).map_err(|e| SessionError::Encode(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    fn cookie_headers(set_cookie: &HeaderValue) -> HeaderMap {
        // Browsers echo back only the name=value pair
        let pair = set_cookie.to_str().unwrap().split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(pair).unwrap());
        headers
    }

    fn sample() -> Session {
        Session {
            oidc_state: Some("state-1".into()),
            odic_restore_url: Some("/reports?page=2".into()),
            ..Session::default()
        }
    }

    #[test]
    fn test_missing_cookie_is_new_session() {
        let codec = SealedCookieCodec::new("secret", "user");
        assert_eq!(codec.load(&HeaderMap::new()).unwrap(), Session::default());
    }

    #[test]
    fn test_store_then_load() {
        let codec = SealedCookieCodec::new("secret", "user");
        let header = codec.store(&sample()).unwrap();

        let loaded = codec.load(&cookie_headers(&header)).unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_cookie_attributes() {
        let codec = SealedCookieCodec::new("secret", "user")
            .secure(true)
            .max_age_secs(Some(600));
        let header = codec.store(&sample()).unwrap();
        let header = header.to_str().unwrap();

        assert!(header.starts_with("user="));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("SameSite=Lax"));
        assert!(header.contains("Path=/"));
        assert!(header.contains("Secure"));
        assert_eq!(header.matches("Max-Age=600").count(), 1);
    }

    #[test]
    fn test_no_max_age_without_ttl() {
        let header = SealedCookieCodec::new("secret", "user")
            .store(&sample())
            .unwrap();

        assert!(!header.to_str().unwrap().contains("Max-Age"));
    }

    #[test]
    fn test_foreign_key_rejected() {
        let header = SealedCookieCodec::new("secret-a", "user")
            .store(&sample())
            .unwrap();
        let codec = SealedCookieCodec::new("secret-b", "user");

        assert!(matches!(
            codec.load(&cookie_headers(&header)),
            Err(SessionError::Decode(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let codec = SealedCookieCodec::new("secret", "user");
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("user=not-a-session"));

        assert!(codec.load(&headers).is_err());
    }

    #[test]
    fn test_oversized_session_rejected() {
        let codec = SealedCookieCodec::new("secret", "user");
        let session = Session {
            token: Some("x".repeat(MAX_COOKIE_BYTES)),
            ..Session::default()
        };

        assert_eq!(codec.store(&session), Err(SessionError::TooLarge));
    }

    #[test]
    fn test_is_authenticated() {
        let now = Utc::now();
        let mut session = Session::default();
        assert!(!session.is_authenticated(now));

        session.token = Some(String::new());
        assert!(!session.is_authenticated(now));

        session.token = Some("access".into());
        assert!(session.is_authenticated(now));

        session.expires_at = Some(now.timestamp() + 60);
        assert!(session.is_authenticated(now));

        session.expires_at = Some(now.timestamp() - 1);
        assert!(!session.is_authenticated(now));
    }
}
