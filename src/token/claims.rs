use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a token grants access or only the right to mint new tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Access => f.write_str("access"),
            TokenKind::Refresh => f.write_str("refresh"),
        }
    }
}

/// Token payload.
///
/// Wire format: `{sub, scopes: [string], exp, iat, jti, type}` with `exp` and
/// `iat` as Unix seconds. Scopes are a set; order on the wire carries no
/// meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
}

impl Claims {
    /// Strict expiry: valid through the `exp` second, expired after it.
    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        now_secs > self.exp
    }

    /// Seconds a revocation record must outlive `now_secs` to cover every
    /// instant at which this token would still verify.
    pub fn remaining_lifetime_secs(&self, now_secs: i64) -> u64 {
        u64::try_from(self.exp.saturating_sub(now_secs).saturating_add(1)).unwrap_or(0)
    }
}

/// An issued token: the compact encoding plus the claims it carries.
///
/// Immutable once issued.
#[derive(Clone)]
pub struct Token {
    pub encoded: String,
    pub claims: Claims,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("encoded", &"[REDACTED]")
            .field("claims", &self.claims)
            .finish()
    }
}

impl Token {
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

/// Access + refresh pair as returned to clients.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}
