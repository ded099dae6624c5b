//! Bearer tokens: claims model and the issuing/verifying service.

mod claims;
mod service;

pub use claims::{Claims, Token, TokenKind, TokenPair};
pub use service::{TokenService, TokenSettings};

/// Extract the token from an `Authorization: Bearer <token>` header value.
///
/// The scheme is matched case-insensitively and the value must have exactly
/// two space-separated parts.
pub fn parse_bearer(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}
