//! Forwarding of admitted requests to the upstream.
//!
//! [`RewritePipeline`] holds the header and URL rewrite steps, built once from
//! configuration. [`ProxyCore`] is the innermost handler of the gateway: it
//! runs the pipeline and streams the exchange through a pooled hyper client.

use axum::http::HeaderMap;
use axum::http::header::{
    CONNECTION, HeaderName, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};

mod forward;
mod rewrite;

pub use forward::ProxyCore;
pub use rewrite::{InboundContext, ProxyRequest, RequestStep, ResponseStep, RewritePipeline};

static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Headers meaningful only for a single transport hop.
static HOP_BY_HOP: [&HeaderName; 9] = [
    &CONNECTION,
    &PROXY_CONNECTION,
    &KEEP_ALIVE,
    &PROXY_AUTHENTICATE,
    &PROXY_AUTHORIZATION,
    &TE,
    &TRAILER,
    &TRANSFER_ENCODING,
    &UPGRADE,
];

/// Remove hop-by-hop headers, including any the `Connection` header lists.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(&CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Remove forwarding headers a client may have sent itself.
pub(crate) fn strip_forwarded(headers: &mut HeaderMap) {
    let spoofable: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name == "forwarded" || name.starts_with("x-forwarded-")
        })
        .cloned()
        .collect();

    for name in spoofable {
        headers.remove(&name);
    }
}
