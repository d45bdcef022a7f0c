//! OpenID Connect provider client.
//!
//! The OIDC middleware talks to its identity provider only through the
//! [`IdentityProvider`] trait:
//!
//! 1. [`IdentityProvider::authorization_url`] builds the browser redirect
//! 2. [`IdentityProvider::exchange_code`] trades the callback `code` for tokens
//! 3. [`IdentityProvider::verify_id_token`] checks the ID token and returns its claims
//!
//! [`DiscoveredProvider`] implements it against a real provider found through
//! `/.well-known/openid-configuration`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

mod discovered;

pub use discovered::{DiscoveredProvider, ProviderMetadata};

/// Errors from talking to, or trusting, the identity provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider discovery failed: {0}")]
    Discovery(String),

    #[error("issuer mismatch: expected {expected:?}, provider reported {found:?}")]
    IssuerMismatch { expected: String, found: String },

    #[error("token exchange failed: {0}")]
    Exchange(String),

    #[error("no id_token field in oauth2 token")]
    MissingIdToken,

    #[error("failed to fetch signing keys: {0}")]
    Jwks(String),

    #[error("id token verification failed: {0}")]
    Verification(String),
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenSet {
    /// The raw ID token, which the authorization-code flow requires.
    pub fn id_token(&self) -> Result<&str, ProviderError> {
        self.id_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ProviderError::MissingIdToken)
    }
}

/// Profile claims copied into the session after login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Profile {
    /// Decode profile claims out of verified ID-token claims.
    pub fn from_claims(claims: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(claims))
    }
}

/// An OpenID Connect identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Authorization endpoint URL carrying `state`.
    fn authorization_url(&self, state: &str) -> String;

    /// Exchange an authorization code for tokens.
    async fn exchange_code(&self, code: &str) -> Result<TokenSet, ProviderError>;

    /// Verify signature, issuer, audience and expiry of a raw ID token and
    /// return its claims.
    async fn verify_id_token(&self, id_token: &str) -> Result<Map<String, Value>, ProviderError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_profile_from_claims() {
        let profile = Profile::from_claims(claims(json!({
            "sub": "123",
            "name": "Alice",
            "email": "alice@example.com",
            "aud": "client"
        })))
        .unwrap();

        assert_eq!(profile.name.as_deref(), Some("Alice"));
        assert_eq!(profile.email.as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn test_profile_missing_fields() {
        let profile = Profile::from_claims(claims(json!({"sub": "123"}))).unwrap();
        assert_eq!(profile, Profile::default());
    }

    #[test]
    fn test_profile_wrong_type_fails() {
        assert!(Profile::from_claims(claims(json!({"name": 7}))).is_err());
    }

    #[test]
    fn test_token_set_requires_id_token() {
        let tokens: TokenSet =
            serde_json::from_value(json!({"access_token": "at", "token_type": "Bearer"})).unwrap();

        assert!(matches!(tokens.id_token(), Err(ProviderError::MissingIdToken)));
    }
}
