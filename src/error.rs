use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal configuration problems detected at startup.
///
/// Every variant maps to `exitcode::CONFIG` in `main`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Failures that stop the gateway before it starts listening.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("OIDC provider unavailable: {0}")]
    Discovery(#[from] crate::oidc::ProviderError),
}

impl StartupError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> exitcode::ExitCode {
        match self {
            StartupError::Config(_) => exitcode::CONFIG,
            StartupError::Discovery(_) => exitcode::UNAVAILABLE,
        }
    }
}

/// Request-scoped rejections produced by the middleware chain and the proxy core.
///
/// Each variant carries its own status code and machine-readable code; the
/// human readable message is whatever `Display` renders.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("session handling failed")]
    Session,

    #[error("OIDC state mismatch, avoid security issue we rejected your request")]
    StateMismatch,

    #[error("{0}")]
    OidcAuthFailed(String),

    #[error("{0}")]
    ProfileRetrievalFailed(String),

    #[error("{0}")]
    SaveSessionFailed(String),

    #[error("{0}")]
    JwtValidationFailed(String),

    #[error("Rate Limit Reached")]
    RateLimitReached,

    #[error("rate limit store failure")]
    RateStore,

    #[error("upstream unavailable")]
    UpstreamUnavailable,

    #[error("upstream timed out")]
    UpstreamTimeout,
}

impl GatewayError {
    /// Machine code written to the `Code` field of the response body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Session => "ERR_SESSION",
            GatewayError::StateMismatch => "ERR_OIDC_STATE_MISMATCH",
            GatewayError::OidcAuthFailed(_) => "ERR_OIDC_AUTH_FAILED",
            GatewayError::ProfileRetrievalFailed(_) => "ERR_OIDC_AUTH_RETRIEVE_PROFILE_FAILED",
            GatewayError::SaveSessionFailed(_) => "ERR_SAVE_SESSION_FAILED",
            GatewayError::JwtValidationFailed(_) => "JWT_VALIDATE_FAILED",
            GatewayError::RateLimitReached => "RATE_LIMIT_REACH",
            GatewayError::RateStore => "ERR_RATE_LIMIT_STORE",
            GatewayError::UpstreamUnavailable => "ERR_UPSTREAM_UNAVAILABLE",
            GatewayError::UpstreamTimeout => "ERR_UPSTREAM_TIMEOUT",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Session | GatewayError::StateMismatch => StatusCode::BAD_REQUEST,
            GatewayError::OidcAuthFailed(_)
            | GatewayError::ProfileRetrievalFailed(_)
            | GatewayError::SaveSessionFailed(_)
            | GatewayError::JwtValidationFailed(_)
            | GatewayError::RateLimitReached => StatusCode::UNAUTHORIZED,
            GatewayError::RateStore => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Wire format of every rejected request.
///
/// Field names are capitalised because existing clients match on
/// `Code` and `ErrorMessage` verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorMessage {
    pub code: String,
    pub error_message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        tracing::warn!(code, status = status.as_u16(), error = %self, "Request rejected");
        crate::metrics::record_rejection(code);

        let body = ErrorMessage {
            code: code.to_string(),
            error_message: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for request-scoped results.
pub type GatewayResult<T> = Result<T, GatewayError>;
