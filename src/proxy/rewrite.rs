//! Request and response rewriting applied around every upstream exchange.
//!
//! # Request Steps (in order)
//!
//! 1. Point the request at the upstream: scheme and authority replaced, the
//!    upstream base path joined with the request path, queries merged and the
//!    inbound `Host` dropped so the client derives it from the new authority
//! 2. Replace the subject header with the authenticated subject, or drop it
//!    when no middleware authenticated the request
//! 3. Set `X-Forwarded-For`, `X-Forwarded-Host` and `X-Forwarded-Proto`
//!    (skipped with `APPEND_FORWARD_HEADERS=false`)
//! 4. Request-leg header rules
//!
//! # Response Steps
//!
//! Response-leg header rules.

use std::net::IpAddr;

use axum::http::header::{HOST, HeaderName};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, Uri};
use tracing::warn;

use crate::config::{Config, HeaderAction, HeaderLeg};
use crate::identity::{Subject, SubjectExt};
use crate::middleware::peer_ip;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// What the gateway observed about the inbound request.
///
/// Captured before any header is stripped, so forwarding steps can still see
/// the chain the client arrived with.
#[derive(Debug, Clone, Default)]
pub struct InboundContext {
    /// `Host` header, or the URI authority for HTTP/2 requests
    pub host: Option<String>,
    /// Inbound `X-Forwarded-For` values joined with `", "`
    pub forwarded_for: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub subject: Option<Subject>,
}

impl InboundContext {
    pub fn capture<B>(req: &Request<B>) -> Self {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()));

        let prior: Vec<&str> = req
            .headers()
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();

        Self {
            host,
            forwarded_for: (!prior.is_empty()).then(|| prior.join(", ")),
            client_ip: peer_ip(req),
            subject: req.subject().cloned(),
        }
    }
}

/// Outbound request head under construction, with its inbound context.
#[derive(Debug)]
pub struct ProxyRequest {
    pub inbound: InboundContext,
    pub out: Parts,
}

/// One mutation of the outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStep {
    SetUpstream(Uri),
    PropagateSubject(HeaderName),
    SetForwarded,
    DeleteHeader(HeaderName),
    SetHeader(HeaderName, HeaderValue),
}

impl RequestStep {
    fn apply(&self, pr: &mut ProxyRequest) {
        match self {
            RequestStep::SetUpstream(target) => set_upstream(&mut pr.out, target),
            RequestStep::PropagateSubject(header) => {
                // Whatever the client sent under this name is never trusted
                pr.out.headers.remove(header);
                if let Some(subject) = &pr.inbound.subject
                    && let Ok(value) = HeaderValue::from_str(subject.as_str())
                {
                    pr.out.headers.insert(header.clone(), value);
                }
            }
            RequestStep::SetForwarded => set_forwarded(pr),
            RequestStep::DeleteHeader(name) => {
                pr.out.headers.remove(name);
            }
            RequestStep::SetHeader(name, value) => {
                pr.out.headers.insert(name.clone(), value.clone());
            }
        }
    }
}

/// One mutation of the upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStep {
    DeleteHeader(HeaderName),
    SetHeader(HeaderName, HeaderValue),
}

impl ResponseStep {
    fn apply(&self, headers: &mut HeaderMap) {
        match self {
            ResponseStep::DeleteHeader(name) => {
                headers.remove(name);
            }
            ResponseStep::SetHeader(name, value) => {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Ordered rewrite steps for both legs of the exchange.
#[derive(Debug, Clone)]
pub struct RewritePipeline {
    request_steps: Vec<RequestStep>,
    response_steps: Vec<ResponseStep>,
}

impl RewritePipeline {
    pub fn from_config(config: &Config) -> Self {
        let mut request_steps = vec![
            RequestStep::SetUpstream(config.upstream.clone()),
            RequestStep::PropagateSubject(config.subject_header.clone()),
        ];
        if config.append_forward_headers {
            request_steps.push(RequestStep::SetForwarded);
        }

        let mut response_steps = Vec::new();
        for rule in &config.header_rules {
            match (rule.leg, &rule.action) {
                (HeaderLeg::Request, HeaderAction::Delete) => {
                    request_steps.push(RequestStep::DeleteHeader(rule.name.clone()));
                }
                (HeaderLeg::Request, HeaderAction::Set(value)) => {
                    request_steps.push(RequestStep::SetHeader(rule.name.clone(), value.clone()));
                }
                (HeaderLeg::Response, HeaderAction::Delete) => {
                    response_steps.push(ResponseStep::DeleteHeader(rule.name.clone()));
                }
                (HeaderLeg::Response, HeaderAction::Set(value)) => {
                    response_steps.push(ResponseStep::SetHeader(rule.name.clone(), value.clone()));
                }
            }
        }

        Self {
            request_steps,
            response_steps,
        }
    }

    pub fn request_steps(&self) -> &[RequestStep] {
        &self.request_steps
    }

    pub fn response_steps(&self) -> &[ResponseStep] {
        &self.response_steps
    }

    pub fn rewrite_request(&self, pr: &mut ProxyRequest) {
        for step in &self.request_steps {
            step.apply(pr);
        }
    }

    pub fn modify_response(&self, headers: &mut HeaderMap) {
        for step in &self.response_steps {
            step.apply(headers);
        }
    }
}

/// Join two URL paths with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", path.strip_prefix('/').unwrap_or(path)),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn set_upstream(out: &mut Parts, target: &Uri) {
    let path = join_paths(target.path(), out.uri.path());
    let path_and_query = match (target.query(), out.uri.query()) {
        (Some(t), Some(r)) if !t.is_empty() && !r.is_empty() => format!("{path}?{t}&{r}"),
        (Some(q), _) | (_, Some(q)) if !q.is_empty() => format!("{path}?{q}"),
        _ => path,
    };

    let mut builder = Uri::builder().path_and_query(path_and_query);
    if let Some(scheme) = target.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = target.authority() {
        builder = builder.authority(authority.clone());
    }

    match builder.build() {
        Ok(uri) => out.uri = uri,
        Err(e) => warn!(error = %e, uri = %out.uri, "Failed to build upstream URI"),
    }
    out.headers.remove(HOST);
}

fn set_forwarded(pr: &mut ProxyRequest) {
    let inbound = &pr.inbound;
    let headers = &mut pr.out.headers;

    match inbound.client_ip {
        Some(ip) => {
            let chain = match &inbound.forwarded_for {
                Some(prior) => format!("{prior}, {ip}"),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert(X_FORWARDED_FOR.clone(), value);
            }
        }
        None => {
            headers.remove(&X_FORWARDED_FOR);
        }
    }

    if let Some(host) = &inbound.host
        && let Ok(value) = HeaderValue::from_str(host)
    {
        headers.insert(X_FORWARDED_HOST.clone(), value);
    }
    headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("http"));
}
