//! Shared fixtures: an echoing upstream, a gateway on an ephemeral port and
//! a mock OpenID Connect provider.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;

use auth_proxy::{Config, Gateway, build_gateway};
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_KID: &str = "test-key";
pub const CLIENT_ID: &str = "gateway-client";
pub const CLIENT_SECRET: &str = "gateway-secret";

const SIGNING_KEY: &str = include_str!("../fixtures/oidc_test_key.pem");
const JWKS: &str = include_str!("../fixtures/oidc_test_jwks.json");

/// Upstream answering every request with a JSON echo of what it received.
pub async fn spawn_upstream() -> SocketAddr {
    async fn echo(req: Request<Body>) -> Json<Value> {
        let headers: Map<String, Value> = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or_default())))
            .collect();

        Json(json!({
            "method": req.method().to_string(),
            "uri": req.uri().to_string(),
            "headers": headers,
        }))
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, Router::new().fallback(echo))
            .await
            .unwrap();
    });
    addr
}

/// Running gateway and its base URL.
pub struct TestGateway {
    pub base_url: String,
    pub gateway: Gateway,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Start a gateway forwarding to `upstream` with extra settings in `vars`.
pub async fn spawn_gateway(upstream: SocketAddr, vars: &[(&str, &str)]) -> TestGateway {
    let upstream = format!("http://{upstream}");
    let mut all = vec![("UPSTREAM", upstream.as_str()), ("METRICS_PORT", "0")];
    all.extend_from_slice(vars);

    let config = Config::from_vars(all).unwrap();
    let gateway = build_gateway(&config).await.unwrap();
    let app = gateway
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestGateway {
        base_url: format!("http://{addr}"),
        gateway,
    }
}

/// HTTP client that leaves redirects and cookies to the test.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// The `name=value` pair of a response's `Set-Cookie` header.
pub fn session_cookie(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("set-cookie")
        .expect("response sets the session cookie")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

/// Mock provider serving discovery and signing keys; tests mount `/token`.
pub async fn mock_provider() -> MockServer {
    let server = MockServer::start().await;
    let issuer = server.uri();

    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/jwks"),
            "response_types_supported": ["code"],
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(JWKS.as_bytes().to_vec(), "application/json"),
        )
        .mount(&server)
        .await;

    server
}

/// Sign `claims` with the fixture RSA key under `kid`.
pub fn sign_id_token(claims: &Value, kid: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(SIGNING_KEY.as_bytes()).unwrap();
    encode(&header, claims, &key).unwrap()
}

/// Well-formed ID-token claims for `issuer`.
pub fn id_token_claims(issuer: &str, name: &str) -> Value {
    let now = chrono::Utc::now().timestamp();
    json!({
        "iss": issuer,
        "aud": CLIENT_ID,
        "sub": "user-1",
        "name": name,
        "email": "alice@example.com",
        "iat": now,
        "exp": now + 300,
    })
}
