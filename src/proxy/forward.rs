//! Innermost handler: forward the rewritten request and stream the response.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response, Version};
use axum::response::IntoResponse;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tower::Service;
use tracing::{debug, warn};

use super::rewrite::{InboundContext, ProxyRequest, RewritePipeline};
use super::{strip_forwarded, strip_hop_by_hop};
use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics;

/// How long pooled upstream connections may stay idle.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Forwards requests to the upstream over a pooled HTTP/1.1 client.
///
/// Bodies are streamed in both directions without buffering. Nothing is
/// retried: a connection failure is a 502 and a response head that does not
/// arrive within the upstream timeout is a 504.
#[derive(Clone)]
pub struct ProxyCore {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    client: Client<HttpConnector, Body>,
    pipeline: RewritePipeline,
    upstream_timeout: Duration,
}

impl ProxyCore {
    pub fn new(pipeline: RewritePipeline, upstream_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(HttpConnector::new());

        debug!(
            request_steps = pipeline.request_steps().len(),
            response_steps = pipeline.response_steps().len(),
            timeout_secs = upstream_timeout.as_secs(),
            "Proxy core ready"
        );

        Self {
            inner: Arc::new(ProxyInner {
                client,
                pipeline,
                upstream_timeout,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(RewritePipeline::from_config(config), config.upstream_timeout)
    }
}

impl ProxyInner {
    async fn forward(&self, req: Request<Body>) -> Response<Body> {
        let inbound = InboundContext::capture(&req);
        let (mut out, body) = req.into_parts();

        strip_hop_by_hop(&mut out.headers);
        strip_forwarded(&mut out.headers);
        // Pooled upstream connections speak HTTP/1.1 whatever the client used
        out.version = Version::HTTP_11;

        let mut pr = ProxyRequest { inbound, out };
        self.pipeline.rewrite_request(&mut pr);

        let method = pr.out.method.clone();
        let uri = pr.out.uri.clone();
        let outbound = Request::from_parts(pr.out, body);
        let start = Instant::now();

        let upstream = match timeout(self.upstream_timeout, self.client.request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(error = %e, %method, %uri, "Upstream request failed");
                metrics::record_upstream_failure("unavailable");
                return GatewayError::UpstreamUnavailable.into_response();
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.upstream_timeout.as_secs(),
                    %method,
                    %uri,
                    "Upstream response timed out"
                );
                metrics::record_upstream_failure("timeout");
                return GatewayError::UpstreamTimeout.into_response();
            }
        };

        let elapsed = start.elapsed();
        let (mut parts, body) = upstream.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        self.pipeline.modify_response(&mut parts.headers);

        debug!(
            %method,
            %uri,
            status = parts.status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Upstream responded"
        );
        metrics::record_upstream_response(parts.status.as_u16(), elapsed.as_secs_f64());

        Response::from_parts(parts, Body::new(body))
    }
}

impl Service<Request<Body>> for ProxyCore {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.forward(req).await) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use axum::Router;
    use axum::body::to_bytes;
    use axum::extract::ConnectInfo;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::any;
    use serde_json::{Map, Value, json};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use crate::identity::{Subject, SubjectExt};

    /// Upstream that echoes what it received as JSON.
    async fn echo(req: Request<Body>) -> impl IntoResponse {
        let headers: Map<String, Value> = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or_default())))
            .collect();
        let uri = req.uri().to_string();
        let method = req.method().to_string();
        let body = to_bytes(req.into_body(), usize::MAX).await.unwrap();

        (
            [("server", "echo"), ("connection", "keep-alive")],
            axum::Json(json!({
                "method": method,
                "uri": uri,
                "headers": headers,
                "body": String::from_utf8_lossy(&body),
            })),
        )
    }

    async fn slow() -> &'static str {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "late"
    }

    async fn spawn_upstream() -> SocketAddr {
        let app = Router::new()
            .route("/slow", any(slow))
            .fallback(echo);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn core_for(upstream: SocketAddr, vars: &[(&str, &str)], timeout: Duration) -> ProxyCore {
        let upstream = format!("http://{upstream}");
        let mut all = vec![("UPSTREAM", upstream.as_str())];
        all.extend_from_slice(vars);
        let config = Config::from_vars(all).unwrap();
        ProxyCore::new(RewritePipeline::from_config(&config), timeout)
    }

    fn request(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .uri(uri)
            .header("host", "gateway.local")
            .extension(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 40000))))
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_method_path_and_body() {
        let addr = spawn_upstream().await;
        let core = core_for(addr, &[], Duration::from_secs(5));

        let req = request("/orders?id=7")
            .method("POST")
            .body(Body::from("payload"))
            .unwrap();
        let response = core.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let echoed = json_body(response).await;
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["uri"], "/orders?id=7");
        assert_eq!(echoed["body"], "payload");
        assert_eq!(echoed["headers"]["host"], addr.to_string());
        assert_eq!(echoed["headers"]["x-forwarded-host"], "gateway.local");
        assert_eq!(echoed["headers"]["x-forwarded-for"], "192.0.2.1");
    }

    #[tokio::test]
    async fn test_spoofed_forwarding_and_subject_headers_replaced() {
        let addr = spawn_upstream().await;
        let core = core_for(addr, &[], Duration::from_secs(5));

        let req = request("/")
            .header("x-forwarded-proto", "https")
            .header("forwarded", "for=6.6.6.6")
            .header("x-user-subject", "admin")
            .body(Body::empty())
            .unwrap();
        let echoed = json_body(core.oneshot(req).await.unwrap()).await;

        assert_eq!(echoed["headers"]["x-forwarded-proto"], "http");
        assert!(echoed["headers"].get("forwarded").is_none());
        assert!(echoed["headers"].get("x-user-subject").is_none());
    }

    #[tokio::test]
    async fn test_subject_header_and_rules() {
        let addr = spawn_upstream().await;
        let core = core_for(
            addr,
            &[
                ("DELETE_REQ_HEADERS_FOO", "1"),
                ("APPEND_REQ_HEADERS_BAR", "baz"),
                ("DELETE_RES_HEADERS_SERVER", "1"),
                ("APPEND_RES_HEADERS_X-GATEWAY", "on"),
            ],
            Duration::from_secs(5),
        );

        let mut req = request("/").header("foo", "x").body(Body::empty()).unwrap();
        req.set_subject(Subject::new("alice").unwrap());
        let response = core.oneshot(req).await.unwrap();

        let headers: HeaderMap = response.headers().clone();
        assert!(!headers.contains_key("server"));
        assert!(!headers.contains_key("connection"));
        assert_eq!(headers["x-gateway"], "on");

        let echoed = json_body(response).await;
        assert!(echoed["headers"].get("foo").is_none());
        assert_eq!(echoed["headers"]["bar"], "baz");
        assert_eq!(echoed["headers"]["x-user-subject"], "alice");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let core = core_for(addr, &[], Duration::from_secs(5));

        let response = core
            .oneshot(request("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["Code"], "ERR_UPSTREAM_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_slow_upstream_is_504() {
        let addr = spawn_upstream().await;
        let core = core_for(addr, &[], Duration::from_millis(100));

        let response = core
            .oneshot(request("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(json_body(response).await["Code"], "ERR_UPSTREAM_TIMEOUT");
    }
}
