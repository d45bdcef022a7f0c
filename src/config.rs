//! Gateway configuration loaded from environment variables.
//!
//! # Core
//!
//! - `UPSTREAM`: required `http://` base URL every request is forwarded to
//! - `LISTEN_ADDR`: bind address (default: `:8080`, a bare `:port` binds all interfaces)
//!
//! # Middleware
//!
//! Each middleware switches itself on from its own settings:
//!
//! - `JWT_SECRET`: enables bearer-token validation
//! - `RATE_LIMIT`: enables rate limiting, format `<count>-<S|M|H|D>` (e.g. `100-M`)
//! - `ODIC_CLIENT_ID` + `ODIC_CLIENT_SECRET`: enable the OIDC login flow, which
//!   then also requires `ODIC_ISSUER`, `ODIC_CALLBACK_URL` and `ODIC_SESSION_SECRET`
//!
//! # Header Rewriting
//!
//! - `DELETE_REQ_HEADERS_<NAME>` / `DELETE_RES_HEADERS_<NAME>`: drop `<NAME>`
//! - `APPEND_REQ_HEADERS_<NAME>=<value>` / `APPEND_RES_HEADERS_<NAME>=<value>`: set `<NAME>`
//! - `DELETE_SOURCE_HEADERS_<NAME>` and `APPEND_CUSTOM_HEADERS_<NAME>` are
//!   accepted as request-leg aliases
//! - `APPEND_FORWARD_HEADERS=false` disables the `X-Forwarded-*` headers

use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use axum::http::header::HeaderName;
use axum::http::uri::Scheme;
use axum::http::{HeaderValue, Uri};
use url::Url;

use crate::error::ConfigError;
use crate::middleware::rate_limit::Rate;

/// Default path the OIDC middleware intercepts as the provider redirect target.
pub const DEFAULT_CALLBACK_PATH: &str = "/_/oidc/callback";

/// Default header carrying the authenticated subject to the upstream.
pub const DEFAULT_SUBJECT_HEADER: &str = "x-user-subject";

/// Gateway configuration.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Forwarding {} to {}", config.listen_addr, config.upstream);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Upstream base URL (scheme, authority and optional base path/query)
    pub upstream: Uri,

    /// Socket address the gateway listens on (default: 0.0.0.0:8080)
    pub listen_addr: SocketAddr,

    /// How long to wait for the upstream response head (default: 30 seconds)
    pub upstream_timeout: Duration,

    // =========================================================================
    // Middleware Configuration
    // =========================================================================
    /// Shared HMAC secret for bearer tokens; `None` disables the JWT middleware
    pub jwt_secret: Option<String>,

    /// Parsed rate budget; `None` disables the rate limiter
    pub rate_limit: Option<Rate>,

    /// Key the limiter on `X-Forwarded-For`/`X-Real-IP` before the peer address
    pub rate_limit_trust_forward_header: bool,

    /// OIDC login flow settings
    pub oidc: OidcConfig,

    // =========================================================================
    // Rewrite Configuration
    // =========================================================================
    /// Inject `X-Forwarded-For`, `X-Forwarded-Host` and `X-Forwarded-Proto`
    pub append_forward_headers: bool,

    /// Outbound header carrying the authenticated subject
    pub subject_header: HeaderName,

    /// Header delete/set rules for both legs, in application order
    pub header_rules: Vec<HeaderRule>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

/// OIDC authorization-code flow settings.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Issuer URL; discovery reads `<issuer>/.well-known/openid-configuration`
    pub issuer: String,
    /// Absolute redirect URI registered with the provider
    pub callback_url: String,
    /// Path intercepted as the callback (default: `/_/oidc/callback`)
    pub callback_path: String,
    /// Secret the session cookie key is derived from
    pub session_secret: String,
    pub scopes: Vec<String>,
    /// Session cookie name (default: `user`)
    pub cookie_name: String,
    /// Session lifetime; `None` keeps a session valid until the cookie is dropped
    pub session_ttl: Option<Duration>,
    /// Bound on discovery, token exchange and JWKS requests (default: 10 seconds)
    pub provider_timeout: Duration,
}

impl OidcConfig {
    /// The login flow runs only when both client credentials are present.
    pub fn enabled(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    /// Mark session cookies `Secure` when the provider redirects back over TLS.
    pub fn secure_cookies(&self) -> bool {
        self.callback_url.starts_with("https://")
    }
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            issuer: String::new(),
            callback_url: String::new(),
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            session_secret: String::new(),
            scopes: vec!["openid".to_string(), "profile".to_string()],
            cookie_name: "user".to_string(),
            session_ttl: None,
            provider_timeout: Duration::from_secs(10),
        }
    }
}

/// Which side of the proxied exchange a header rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLeg {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAction {
    Delete,
    Set(HeaderValue),
}

/// A validated header rewrite rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRule {
    pub leg: HeaderLeg,
    pub name: HeaderName,
    pub action: HeaderAction,
}

/// Env prefixes that declare header rules, with the leg and action they imply.
const HEADER_RULE_PREFIXES: &[(&str, HeaderLeg, bool)] = &[
    ("DELETE_REQ_HEADERS_", HeaderLeg::Request, true),
    ("DELETE_SOURCE_HEADERS_", HeaderLeg::Request, true),
    ("APPEND_REQ_HEADERS_", HeaderLeg::Request, false),
    ("APPEND_CUSTOM_HEADERS_", HeaderLeg::Request, false),
    ("DELETE_RES_HEADERS_", HeaderLeg::Response, true),
    ("APPEND_RES_HEADERS_", HeaderLeg::Response, false),
];

impl Config {
    /// Load configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a required setting is missing or any value
    /// fails to parse or validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_vars(env::vars())
    }

    /// Build configuration from an explicit set of key/value pairs.
    ///
    /// Unknown keys are ignored, so the whole process environment can be
    /// passed in.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| vars.get(key).map(String::as_str).filter(|v| !v.is_empty());

        let upstream = parse_upstream(get("UPSTREAM").ok_or(ConfigError::Missing("UPSTREAM"))?)?;

        let rate_limit = get("RATE_LIMIT")
            .map(|raw| {
                raw.parse::<Rate>()
                    .map_err(|e| ConfigError::invalid("RATE_LIMIT", e.to_string()))
            })
            .transpose()?;

        let session_ttl_secs: u64 = parse_var(&vars, "ODIC_SESSION_TTL_SECS", 0)?;

        let oidc = OidcConfig {
            client_id: get("ODIC_CLIENT_ID").unwrap_or_default().to_string(),
            client_secret: get("ODIC_CLIENT_SECRET").unwrap_or_default().to_string(),
            issuer: get("ODIC_ISSUER").unwrap_or_default().to_string(),
            callback_url: get("ODIC_CALLBACK_URL").unwrap_or_default().to_string(),
            callback_path: get("ODIC_CALLBACK_PATH")
                .unwrap_or(DEFAULT_CALLBACK_PATH)
                .to_string(),
            session_secret: get("ODIC_SESSION_SECRET").unwrap_or_default().to_string(),
            scopes: get("ODIC_SCOPES")
                .map(parse_list)
                .unwrap_or_else(|| OidcConfig::default().scopes),
            cookie_name: get("ODIC_SESSION_COOKIE").unwrap_or("user").to_string(),
            session_ttl: (session_ttl_secs > 0).then(|| Duration::from_secs(session_ttl_secs)),
            provider_timeout: Duration::from_secs(parse_var(
                &vars,
                "ODIC_PROVIDER_TIMEOUT_SECS",
                10,
            )?),
        };

        let subject_header = HeaderName::from_bytes(
            get("SUBJECT_HEADER")
                .unwrap_or(DEFAULT_SUBJECT_HEADER)
                .as_bytes(),
        )
        .map_err(|e| ConfigError::invalid("SUBJECT_HEADER", e.to_string()))?;

        let config = Self {
            upstream,
            listen_addr: parse_listen_addr(get("LISTEN_ADDR").unwrap_or(":8080"))?,
            upstream_timeout: Duration::from_secs(parse_var(&vars, "UPSTREAM_TIMEOUT_SECS", 30)?),
            jwt_secret: get("JWT_SECRET").map(str::to_string),
            rate_limit,
            rate_limit_trust_forward_header: parse_var(
                &vars,
                "RATE_LIMIT_TRUST_FORWARD_HEADER",
                true,
            )?,
            oidc,
            // Only an explicit "false" turns forwarding headers off
            append_forward_headers: get("APPEND_FORWARD_HEADERS") != Some("false"),
            subject_header,
            header_rules: parse_header_rules(&vars)?,
            metrics_port: parse_var(&vars, "METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate cross-field requirements.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if validation fails.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "UPSTREAM_TIMEOUT_SECS",
                "must be greater than 0",
            ));
        }

        if !self.oidc.enabled() {
            return Ok(());
        }

        if self.oidc.issuer.is_empty() {
            return Err(ConfigError::Missing("ODIC_ISSUER"));
        }
        if self.oidc.session_secret.is_empty() {
            return Err(ConfigError::Missing("ODIC_SESSION_SECRET"));
        }
        if self.oidc.callback_url.is_empty() {
            return Err(ConfigError::Missing("ODIC_CALLBACK_URL"));
        }
        Url::parse(&self.oidc.callback_url)
            .map_err(|e| ConfigError::invalid("ODIC_CALLBACK_URL", e.to_string()))?;
        Url::parse(&self.oidc.issuer)
            .map_err(|e| ConfigError::invalid("ODIC_ISSUER", e.to_string()))?;

        if !self.oidc.callback_path.starts_with('/') {
            return Err(ConfigError::invalid(
                "ODIC_CALLBACK_PATH",
                "must start with '/'",
            ));
        }
        if self.oidc.provider_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "ODIC_PROVIDER_TIMEOUT_SECS",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }
}

/// Default configuration for tests.
///
/// Deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: Uri::from_static("http://127.0.0.1:8000"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream_timeout: Duration::from_secs(30),
            jwt_secret: None,
            rate_limit: None,
            rate_limit_trust_forward_header: true,
            oidc: OidcConfig::default(),
            append_forward_headers: true,
            subject_header: HeaderName::from_static(DEFAULT_SUBJECT_HEADER),
            header_rules: Vec::new(),
            metrics_port: 9090,
        }
    }
}

/// Parse a variable into `T`, falling back to `default` when unset or empty.
fn parse_var<T>(vars: &BTreeMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name).filter(|v| !v.is_empty()) {
        Some(val) => val
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(name, e.to_string())),
        None => Ok(default),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse and validate the upstream base URL.
///
/// Only plain `http` upstreams are forwarded to.
fn parse_upstream(raw: &str) -> Result<Uri, ConfigError> {
    let uri: Uri = raw
        .trim()
        .parse()
        .map_err(|e: axum::http::uri::InvalidUri| ConfigError::invalid("UPSTREAM", e.to_string()))?;

    if uri.scheme() != Some(&Scheme::HTTP) {
        return Err(ConfigError::invalid(
            "UPSTREAM",
            "only http:// upstreams are supported",
        ));
    }
    if uri.authority().is_none() {
        return Err(ConfigError::invalid("UPSTREAM", "missing host"));
    }

    Ok(uri)
}

/// Parse a listen address, treating `:port` as all interfaces.
fn parse_listen_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    let raw = raw.trim();
    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };

    normalized
        .parse()
        .map_err(|e: std::net::AddrParseError| ConfigError::invalid("LISTEN_ADDR", e.to_string()))
}

/// Collect header rules from the prefixed variables.
///
/// Per leg, deletions come before sets and each group is ordered by header
/// name, so the resulting rule list does not depend on environment order.
fn parse_header_rules(vars: &BTreeMap<String, String>) -> Result<Vec<HeaderRule>, ConfigError> {
    let mut rules = Vec::new();

    for leg in [HeaderLeg::Request, HeaderLeg::Response] {
        for delete in [true, false] {
            let mut group = Vec::new();

            for &(prefix, _, _) in HEADER_RULE_PREFIXES
                .iter()
                .filter(|&&(_, l, d)| l == leg && d == delete)
            {
                for (key, value) in vars.iter().filter(|(k, _)| k.starts_with(prefix)) {
                    let raw_name = key.trim_start_matches(prefix);
                    let name = HeaderName::from_bytes(raw_name.as_bytes())
                        .map_err(|e| ConfigError::invalid(key.as_str(), e.to_string()))?;
                    let action = if delete {
                        HeaderAction::Delete
                    } else {
                        HeaderAction::Set(
                            HeaderValue::from_str(value)
                                .map_err(|e| ConfigError::invalid(key.as_str(), e.to_string()))?,
                        )
                    };
                    group.push(HeaderRule { leg, name, action });
                }
            }

            group.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
            rules.extend(group);
        }
    }

    Ok(rules)
}
