//! Client identification for rate limiting and forwarding headers.
//!
//! # Key Priority
//!
//! When forwarded headers are trusted (`RATE_LIMIT_TRUST_FORWARD_HEADER`,
//! the default):
//!
//! 1. First entry of `X-Forwarded-For`
//! 2. `X-Real-IP`
//! 3. Peer address of the TCP connection
//! 4. [`UNKNOWN_IP`]
//!
//! Otherwise only the peer address is used.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! Trusting forwarded headers lets a client pick its own rate-limit key by
//! sending `X-Forwarded-For` itself. Only leave it on when the gateway sits
//! behind a reverse proxy that overwrites these headers.
//!
//! The peer address comes from axum's `ConnectInfo`, which is present when the
//! router is served with `into_make_service_with_connect_info`.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::debug;

/// Fallback key when no client address can be determined.
///
/// All such requests share one rate-limit budget.
pub const UNKNOWN_IP: &str = "unknown";

/// Where a forwarded client address was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    /// First entry of X-Forwarded-For.
    FromXff(&'a str),
    FromRealIp(&'a str),
    NotFound,
}

/// Read the client address from forwarding headers without allocating.
#[inline]
fn extract_ip_from_headers<B>(req: &Request<B>) -> ExtractedIp<'_> {
    // Format: "client, proxy1, proxy2" - we want the first (client) entry
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return ExtractedIp::FromXff(first_ip);
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ExtractedIp::FromRealIp(value.trim());
    }

    ExtractedIp::NotFound
}

/// Peer IP of the connection the request arrived on, if known.
#[inline]
pub fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Rate-limit key identifying the client that sent `req`.
///
/// # Returns
///
/// `Cow<'static, str>` - borrowed for [`UNKNOWN_IP`], owned otherwise.
#[inline]
pub fn client_key<B>(req: &Request<B>, trust_forward_header: bool) -> Cow<'static, str> {
    if trust_forward_header {
        match extract_ip_from_headers(req) {
            ExtractedIp::FromXff(ip) => {
                debug!(client_ip = %ip, "Client key from X-Forwarded-For");
                return Cow::Owned(ip.to_string());
            }
            ExtractedIp::FromRealIp(ip) => {
                debug!(client_ip = %ip, "Client key from X-Real-IP");
                return Cow::Owned(ip.to_string());
            }
            ExtractedIp::NotFound => {}
        }
    }

    match peer_ip(req) {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}
