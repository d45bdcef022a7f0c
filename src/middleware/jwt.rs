//! Bearer-token validation against a shared HMAC secret.
//!
//! # Behavior
//!
//! - The token is read from `Authorization`, with a leading `Bearer ` stripped
//!   when present. A missing header is treated as an empty token and fails.
//! - Signatures are checked with HS256, HS384 or HS512 under `JWT_SECRET`.
//! - `exp` and `nbf` are enforced when present, with no leeway. Neither is
//!   required and no audience is checked.
//! - A non-empty string `sub` claim becomes the request's [`Subject`].
//!
//! Any failure ends the request with 401 `JWT_VALIDATE_FAILED`; the wrapped
//! handler is never called.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::{Map, Value};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use tracing::debug;

use super::{BoxHandler, Middleware};
use crate::error::GatewayError;
use crate::identity::{Subject, SubjectExt};

/// Bearer-token stage of the gateway pipeline.
///
/// Enabled when `JWT_SECRET` is set.
pub struct JwtMiddleware {
    layer: Option<JwtLayer>,
}

impl JwtMiddleware {
    /// Build from an optional secret; `None` or an empty secret disables it.
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            layer: secret.filter(|s| !s.is_empty()).map(JwtLayer::new),
        }
    }
}

impl Middleware for JwtMiddleware {
    fn name(&self) -> &'static str {
        "JwtMiddleware"
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

/// JWT validation layer for Tower middleware stack.
#[derive(Clone)]
pub struct JwtLayer {
    verifier: Arc<TokenVerifier>,
}

impl JwtLayer {
    pub fn new(secret: &str) -> Self {
        Self {
            verifier: Arc::new(TokenVerifier::new(secret)),
        }
    }
}

impl<S> Layer<S> for JwtLayer {
    type Service = JwtService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JwtService {
            inner,
            verifier: self.verifier.clone(),
        }
    }
}

struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify `token` and return its subject, if it carries one.
    fn verify(&self, token: &str) -> Result<Option<Subject>, jsonwebtoken::errors::Error> {
        let data = decode::<Map<String, Value>>(token, &self.key, &self.validation)?;

        // A non-string `sub` is ignored rather than rejected
        Ok(data
            .claims
            .get("sub")
            .and_then(Value::as_str)
            .and_then(Subject::new))
    }
}

/// Strip an optional `Bearer ` prefix from the `Authorization` value.
fn bearer_token<B>(req: &Request<B>) -> &str {
    let value = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    value.strip_prefix("Bearer ").unwrap_or(value)
}

/// JWT validation service wrapper.
#[derive(Clone)]
pub struct JwtService<S> {
    inner: S,
    verifier: Arc<TokenVerifier>,
}

impl<S> Service<Request<Body>> for JwtService<S>
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
        let subject = match self.verifier.verify(bearer_token(&req)) {
            Ok(subject) => subject,
            Err(e) => {
                let rejection = GatewayError::JwtValidationFailed(e.to_string());
                return Box::pin(async move { Ok(rejection.into_response()) });
            }
        };

        if let Some(subject) = subject {
            debug!(subject = %subject, "Bearer token accepted");
            req.set_subject(subject);
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await })
    }
}
