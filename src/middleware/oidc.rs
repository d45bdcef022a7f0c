//! Browser login through the OpenID Connect authorization-code flow.
//!
//! # Flow
//!
//! ```text
//! GET /reports (no session)
//!   → 307 to provider, session = {oidc_state, odic_restore_url: "/reports"}
//! GET /_/oidc/callback?state=..&code=..
//!   → state checked, code exchanged, ID token verified
//!   → 307 to /reports, session = {token, profile_name, profile_email, ...}
//! GET /reports (authenticated session)
//!   → forwarded with Subject = profile_name
//! ```
//!
//! # Failure Codes
//!
//! | Condition | Status | Code |
//! |---|---|---|
//! | Session cookie cannot be opened | 400 | `ERR_SESSION` |
//! | Callback state missing or different | 400 | `ERR_OIDC_STATE_MISMATCH` |
//! | Exchange or ID-token verification fails | 401 | `ERR_OIDC_AUTH_FAILED` |
//! | Profile claims cannot be decoded | 401 | `ERR_OIDC_AUTH_RETRIEVE_PROFILE_FAILED` |
//! | Session cannot be written | 401 | `ERR_SAVE_SESSION_FAILED` |
//!
//! The state token is single use: once a callback presents the matching
//! value it is cleared from the session whatever the outcome of the exchange.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderValue, Request, Response, Uri};
use axum::response::{IntoResponse, Redirect};
use chrono::Utc;
use subtle::ConstantTimeEq;
use tokio::time::timeout;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BoxHandler, Middleware};
use crate::config::OidcConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::identity::{Subject, SubjectExt};
use crate::oidc::{IdentityProvider, Profile};
use crate::session::{Session, SessionCodec};

/// Per-deployment knobs of the login flow.
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub callback_path: String,
    /// `None` keeps sessions valid until the cookie disappears
    pub session_ttl: Option<Duration>,
    /// Upper bound on the code exchange
    pub exchange_timeout: Duration,
}

impl OidcSettings {
    pub fn from_config(config: &OidcConfig) -> Self {
        Self {
            callback_path: config.callback_path.clone(),
            session_ttl: config.session_ttl,
            exchange_timeout: config.provider_timeout,
        }
    }
}

/// OIDC stage of the gateway pipeline.
///
/// Enabled when both `ODIC_CLIENT_ID` and `ODIC_CLIENT_SECRET` are set.
pub struct OidcMiddleware {
    layer: Option<OidcLayer>,
}

impl OidcMiddleware {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        codec: Arc<dyn SessionCodec>,
        settings: OidcSettings,
    ) -> Self {
        Self {
            layer: Some(OidcLayer::new(provider, codec, settings)),
        }
    }

    /// A middleware that never participates.
    pub fn disabled() -> Self {
        Self { layer: None }
    }
}

impl Middleware for OidcMiddleware {
    fn name(&self) -> &'static str {
        "OidcMiddleware"
    }

    fn enabled(&self) -> bool {
        self.layer.is_some()
    }

    fn handler(&self, next: BoxHandler) -> BoxHandler {
        match &self.layer {
            Some(layer) => BoxCloneSyncService::new(layer.layer(next)),
            None => next,
        }
    }
}

/// OIDC login layer for Tower middleware stack.
#[derive(Clone)]
pub struct OidcLayer {
    flow: Arc<LoginFlow>,
}

impl OidcLayer {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        codec: Arc<dyn SessionCodec>,
        settings: OidcSettings,
    ) -> Self {
        Self {
            flow: Arc::new(LoginFlow {
                provider,
                codec,
                settings,
            }),
        }
    }
}

impl<S> Layer<S> for OidcLayer {
    type Service = OidcService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OidcService {
            inner,
            flow: self.flow.clone(),
        }
    }
}

/// OIDC login service wrapper.
#[derive(Clone)]
pub struct OidcService<S> {
    inner: S,
    flow: Arc<LoginFlow>,
}

impl<S> Service<Request<Body>> for OidcService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let flow = self.flow.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let session = match flow.codec.load(req.headers()) {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "Rejecting request with unreadable session");
                    return Ok(GatewayError::Session.into_response());
                }
            };

            if req.uri().path() == flow.settings.callback_path {
                return Ok(flow.handle_callback(session, req.uri()).await);
            }

            if !session.is_authenticated(Utc::now()) {
                return Ok(flow.begin_login(req.uri()));
            }

            if let Some(subject) = session.profile_name.and_then(Subject::new) {
                req.set_subject(subject);
            }
            inner.call(req).await
        })
    }
}

/// Query parameters the provider sends back to the callback path.
#[derive(Debug, Default)]
struct CallbackParams {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    fn from_uri(uri: &Uri) -> Self {
        let mut params = Self::default();
        let query = uri.query().unwrap_or_default();

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "state" => &mut params.state,
                "code" => &mut params.code,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            slot.get_or_insert_with(|| value.into_owned());
        }

        params
    }
}

/// Compare the callback state with the one this session issued.
///
/// A session that never issued a state matches nothing.
fn state_matches(issued: Option<&str>, received: Option<&str>) -> bool {
    match (issued, received) {
        (Some(issued), Some(received)) if !issued.is_empty() => {
            issued.as_bytes().ct_eq(received.as_bytes()).into()
        }
        _ => false,
    }
}

/// Reduce a requested path to a same-origin redirect target.
///
/// Leading slashes collapse to one, so `//host/path` cannot name another
/// origin. Anything that is not an origin path falls back to `/`.
fn local_restore_target(raw: Option<&str>) -> String {
    match raw {
        Some(target) if target.starts_with('/') => {
            let rest = target.trim_start_matches('/');
            // Browsers read `/\host` as `//host`
            if rest.starts_with('\\') {
                "/".to_string()
            } else {
                format!("/{rest}")
            }
        }
        _ => "/".to_string(),
    }
}

struct LoginFlow {
    provider: Arc<dyn IdentityProvider>,
    codec: Arc<dyn SessionCodec>,
    settings: OidcSettings,
}

impl LoginFlow {
    /// Start a login: issue a fresh state and send the browser to the provider.
    fn begin_login(&self, uri: &Uri) -> Response<Body> {
        let state = Uuid::new_v4().to_string();
        let restore_url = local_restore_target(uri.path_and_query().map(|pq| pq.as_str()));

        let session = Session {
            oidc_state: Some(state.clone()),
            odic_restore_url: Some(restore_url),
            ..Session::default()
        };

        match self.codec.store(&session) {
            Ok(cookie) => {
                debug!(path = %uri.path(), "Redirecting unauthenticated request to provider");
                redirect_with_cookie(&self.provider.authorization_url(&state), cookie)
            }
            Err(e) => GatewayError::SaveSessionFailed(e.to_string()).into_response(),
        }
    }

    async fn handle_callback(&self, mut session: Session, uri: &Uri) -> Response<Body> {
        let params = CallbackParams::from_uri(uri);

        if !state_matches(session.oidc_state.as_deref(), params.state.as_deref()) {
            return GatewayError::StateMismatch.into_response();
        }
        session.oidc_state = None;

        let restore_url = local_restore_target(session.odic_restore_url.as_deref());

        if let Err(rejection) = self.complete_login(&mut session, &params).await {
            let mut response = rejection.into_response();
            // Persist the consumed state so the callback cannot be replayed
            if let Ok(cookie) = self.codec.store(&session) {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            return response;
        }

        session.odic_restore_url = None;
        match self.codec.store(&session) {
            Ok(cookie) => {
                info!(
                    profile = session.profile_name.as_deref().unwrap_or_default(),
                    "OIDC login completed"
                );
                redirect_with_cookie(&restore_url, cookie)
            }
            Err(e) => GatewayError::SaveSessionFailed(e.to_string()).into_response(),
        }
    }

    async fn complete_login(
        &self,
        session: &mut Session,
        params: &CallbackParams,
    ) -> GatewayResult<()> {
        if let Some(error) = &params.error {
            let detail = params.error_description.as_deref().unwrap_or(error);
            return Err(GatewayError::OidcAuthFailed(format!(
                "provider returned {error}: {detail}"
            )));
        }

        let code = params.code.as_deref().unwrap_or_default();
        let tokens = timeout(
            self.settings.exchange_timeout,
            self.provider.exchange_code(code),
        )
        .await
        .map_err(|_| GatewayError::OidcAuthFailed("token exchange timed out".to_string()))?
        .map_err(|e| GatewayError::OidcAuthFailed(e.to_string()))?;

        let id_token = tokens
            .id_token()
            .map_err(|e| GatewayError::OidcAuthFailed(e.to_string()))?;
        let claims = self
            .provider
            .verify_id_token(id_token)
            .await
            .map_err(|e| GatewayError::OidcAuthFailed(e.to_string()))?;

        let profile = Profile::from_claims(claims)
            .map_err(|e| GatewayError::ProfileRetrievalFailed(e.to_string()))?;

        let now = Utc::now().timestamp();
        session.token = Some(tokens.access_token);
        session.profile_name = profile.name;
        session.profile_email = profile.email;
        session.authenticated_at = Some(now);
        session.expires_at = self.settings.session_ttl.map(|ttl| {
            now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
        });

        Ok(())
    }
}

fn redirect_with_cookie(location: &str, cookie: HeaderValue) -> Response<Body> {
    let mut response = Redirect::temporary(location).into_response();
    response.headers_mut().append(SET_COOKIE, cookie);
    response
}
