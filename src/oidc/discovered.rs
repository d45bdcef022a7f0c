//! Identity provider configured through OpenID Connect discovery.

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use super::{IdentityProvider, ProviderError, TokenSet};
use crate::config::OidcConfig;

/// Signing algorithms accepted on ID tokens.
///
/// HMAC algorithms are excluded: the JWKS only ever publishes public keys.
const ID_TOKEN_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// Subset of the discovery document this gateway relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

/// Provider whose endpoints were read from its discovery document.
pub struct DiscoveredProvider {
    http: reqwest::Client,
    metadata: ProviderMetadata,
    authorization_endpoint: Url,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scopes: String,
    /// Refetched whenever a token names a key id that is not cached
    jwks: RwLock<Option<JwkSet>>,
}

impl DiscoveredProvider {
    /// Fetch `<issuer>/.well-known/openid-configuration` and build a provider.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Discovery` if the document cannot be fetched or
    /// parsed, and `ProviderError::IssuerMismatch` if it names another issuer.
    pub async fn discover(config: &OidcConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.provider_timeout)
            .build()
            .map_err(|e| ProviderError::Discovery(e.to_string()))?;

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            config.issuer.trim_end_matches('/')
        );
        debug!(url = %discovery_url, "Fetching OIDC discovery document");

        let metadata: ProviderMetadata = http
            .get(&discovery_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ProviderError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::Discovery(e.to_string()))?;

        if metadata.issuer != config.issuer {
            return Err(ProviderError::IssuerMismatch {
                expected: config.issuer.clone(),
                found: metadata.issuer,
            });
        }

        let authorization_endpoint = Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| ProviderError::Discovery(format!("authorization_endpoint: {e}")))?;

        info!(
            issuer = %metadata.issuer,
            token_endpoint = %metadata.token_endpoint,
            "OIDC provider discovered"
        );

        Ok(Self {
            http,
            metadata,
            authorization_endpoint,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.callback_url.clone(),
            scopes: config.scopes.join(" "),
            jwks: RwLock::new(None),
        })
    }

    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    async fn fetch_jwks(&self) -> Result<JwkSet, ProviderError> {
        debug!(url = %self.metadata.jwks_uri, "Fetching provider signing keys");

        self.http
            .get(&self.metadata.jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ProviderError::Jwks(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::Jwks(e.to_string()))
    }

    /// Find the key for `kid`, refreshing the cached set once on a miss.
    async fn signing_key(&self, kid: Option<&str>) -> Result<Jwk, ProviderError> {
        if let Some(jwks) = self.jwks.read().await.as_ref()
            && let Some(jwk) = select_key(jwks, kid)
        {
            return Ok(jwk);
        }

        let fresh = self.fetch_jwks().await?;
        let found = select_key(&fresh, kid);
        *self.jwks.write().await = Some(fresh);

        found.ok_or_else(|| {
            ProviderError::Verification(format!("no signing key matches kid {kid:?}"))
        })
    }
}

/// Pick the key named by `kid`, or the first key when the token names none.
fn select_key(jwks: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => jwks.find(kid).cloned(),
        None => jwks.keys.first().cloned(),
    }
}

#[async_trait]
impl IdentityProvider for DiscoveredProvider {
    fn authorization_url(&self, state: &str) -> String {
        let mut url = self.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.scopes)
            .append_pair("state", state);
        url.into()
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, ProviderError> {
        let response = self
            .http
            .post(&self.metadata.token_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Exchange(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        response
            .json::<TokenSet>()
            .await
            .map_err(|e| ProviderError::Exchange(e.to_string()))
    }

    async fn verify_id_token(&self, id_token: &str) -> Result<Map<String, Value>, ProviderError> {
        let header =
            decode_header(id_token).map_err(|e| ProviderError::Verification(e.to_string()))?;

        if !ID_TOKEN_ALGORITHMS.contains(&header.alg) {
            return Err(ProviderError::Verification(format!(
                "unsupported signing algorithm {:?}",
                header.alg
            )));
        }

        let jwk = self.signing_key(header.kid.as_deref()).await?;
        let key =
            DecodingKey::from_jwk(&jwk).map_err(|e| ProviderError::Verification(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_issuer(&[self.metadata.issuer.as_str()]);

        decode::<Map<String, Value>>(id_token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| ProviderError::Verification(e.to_string()))
    }
}
