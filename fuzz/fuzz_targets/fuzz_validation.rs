//! Fuzz testing for request inspection and credential parsing.
//!
//! Everything here sees attacker-controlled bytes before any credential is
//! checked, so none of it may panic:
//!
//! - `InputValidator`: URL, query string and body inspection for every body
//!   kind, including invalid UTF-8 and deeply nested JSON
//! - `parse_bearer` and `TokenService::decode` on arbitrary header values
//! - `EncryptedPayload::from_json` on arbitrary decrypt request bodies
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_validation
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```

#![no_main]

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use gatekeeper::clock::SystemClock;
use gatekeeper::crypto::EncryptedPayload;
use gatekeeper::store::MemoryStore;
use gatekeeper::token::{TokenService, TokenSettings, parse_bearer};
use gatekeeper::validation::{BodyKind, InputValidator};

#[derive(Arbitrary, Debug)]
struct Request<'a> {
    uri: &'a str,
    content_type: &'a str,
    authorization: &'a str,
    body: &'a [u8],
}

static VALIDATOR: LazyLock<Option<InputValidator>> =
    LazyLock::new(|| InputValidator::with_defaults().ok());

static TOKENS: LazyLock<TokenService> = LazyLock::new(|| {
    let clock = SystemClock::shared();
    TokenService::new(
        &TokenSettings {
            secret: "fuzz-secret-0123456789abcdef0123456789".to_string(),
            access_ttl: Duration::from_secs(60),
            refresh_ttl: Duration::from_secs(120),
        },
        Arc::new(MemoryStore::new(clock.clone())),
        clock,
    )
});

fuzz_target!(|req: Request<'_>| {
    if let Some(validator) = VALIDATOR.as_ref() {
        let _ = validator.inspect(req.uri, Some(req.content_type), req.body);
        let _ = validator.inspect_query(req.uri);
        for kind in [BodyKind::Json, BodyKind::Form, BodyKind::Text] {
            let _ = validator.inspect_body(kind, req.body);
        }
    }

    if let Some(token) = parse_bearer(req.authorization) {
        let _ = TOKENS.decode(token);
    }

    if let Ok(json) = std::str::from_utf8(req.body) {
        let _ = EncryptedPayload::from_json(json);
    }
});
