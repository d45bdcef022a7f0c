//! Fuzz testing for parsers that see client or operator controlled input.
//!
//! Every target must return a `Result` and never panic:
//!
//! - `SealedCookieCodec::load` on arbitrary `Cookie` headers
//! - `Rate::from_str` on arbitrary `RATE_LIMIT` values
//! - `Config::from_vars` on arbitrary settings
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_client_input -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use auth_proxy::Config;
use auth_proxy::middleware::Rate;
use auth_proxy::session::{SealedCookieCodec, SessionCodec};
use axum::http::{HeaderMap, HeaderValue, header::COOKIE};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    cookie: Vec<u8>,
    rate: String,
    vars: Vec<(String, String)>,
}

fuzz_target!(|input: Input| {
    let codec = SealedCookieCodec::new("fuzz-secret", "user");
    if let Ok(value) = HeaderValue::from_bytes(&input.cookie) {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, value);
        let _ = codec.load(&headers);
    }

    if let Ok(rate) = input.rate.parse::<Rate>() {
        assert!(rate.limit > 0);
    }

    let _ = Config::from_vars(input.vars);
});
