//! Bearer token issuance and verification.
//!
//! Tokens are HS256-signed compact JWTs. Expiry is enforced against the
//! injected [`Clock`](crate::clock::Clock) rather than inside the JWT library
//! so that the boundary is exact (no leeway) and testable without sleeping.
//!
//! ## Lifecycle
//!
//! ```text
//! Issued -> Valid -> Expired
//!                 -> Revoked
//! ```
//!
//! Both terminal states are final. Revocation records live exactly as long as
//! the token they cancel, so the revocation store never grows past the set of
//! tokens that could still verify.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};

use super::claims::{Claims, Token, TokenKind, TokenPair};
use crate::authz::{Role, scopes_for_roles};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::store::{RevocationStore, StoreFailurePolicy};

/// Signing secret and lifetimes.
#[derive(Clone)]
pub struct TokenSettings {
    pub secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl fmt::Debug for TokenSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSettings")
            .field("secret", &"[REDACTED]")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

impl TokenSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            secret: config.jwt_secret.clone(),
            access_ttl: config.access_token_ttl,
            refresh_ttl: config.refresh_token_ttl,
        }
    }
}

/// Issues, verifies, revokes and rotates tokens.
///
/// Thread-safe; share it behind an `Arc`.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
    revocations: Arc<dyn RevocationStore>,
    clock: SharedClock,
    failure_policy: StoreFailurePolicy,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

fn duration_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

impl TokenService {
    pub fn new(
        settings: &TokenSettings,
        revocations: Arc<dyn RevocationStore>,
        clock: SharedClock,
    ) -> Self {
        let secret = settings.secret.as_bytes();

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against our own clock in `verify`
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            access_ttl: settings.access_ttl,
            refresh_ttl: settings.refresh_ttl,
            revocations,
            clock,
            failure_policy: StoreFailurePolicy::default(),
        }
    }

    /// Policy applied when the revocation store is unreachable during
    /// `verify`. Refresh rotation always fails closed regardless.
    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn lifetime(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        }
    }

    /// Mint a new token. Pure apart from reading the clock and the RNG.
    pub fn issue<I, S>(&self, subject: &str, scopes: I, kind: TokenKind) -> AppResult<Token>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = self.clock.now_secs();
        let claims = Claims {
            sub: subject.to_string(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            exp: now.saturating_add(duration_secs(self.lifetime(kind))),
            iat: now,
            jti: uuid::Uuid::new_v4().to_string(),
            kind,
        };

        let encoded = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Failed to sign token: {e}")))?;

        metrics::record_token_issued(kind);
        tracing::debug!(sub = %claims.sub, jti = %claims.jti, kind = %kind, "Issued token");

        Ok(Token { encoded, claims })
    }

    /// Issue an access + refresh pair carrying the same subject and scopes.
    pub fn issue_pair<I, S>(&self, subject: &str, scopes: I) -> AppResult<TokenPair>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scopes: Vec<String> = scopes.into_iter().map(Into::into).collect();
        let access = self.issue(subject, scopes.iter().cloned(), TokenKind::Access)?;
        let refresh = self.issue(subject, scopes, TokenKind::Refresh)?;

        Ok(TokenPair {
            access_token: access.encoded,
            refresh_token: refresh.encoded,
            token_type: "bearer".to_string(),
            expires_in: self.access_ttl.as_secs(),
        })
    }

    /// Issue a pair whose scopes are the union of `roles`. Roles are resolved
    /// here, once; later changes to the role table do not affect the tokens.
    pub fn issue_for_roles(&self, subject: &str, roles: &[Role]) -> AppResult<TokenPair> {
        self.issue_pair(subject, scopes_for_roles(roles))
    }

    /// Check the signature and decode the claims. Expiry, kind and revocation
    /// are not checked here.
    pub fn decode(&self, token: &str) -> AppResult<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(map_decode_error)
    }

    /// Fully verify `token` as a token of kind `expected`.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if the integrity check or decoding fails
    /// - `ExpiredToken` if now is past `exp`
    /// - `WrongTokenKind` if the `type` claim differs from `expected`
    /// - `RevokedToken` if the JTI is in the revocation store
    /// - `StoreUnavailable` if the store is down and the policy is fail-closed
    pub async fn verify(&self, token: &str, expected: TokenKind) -> AppResult<Claims> {
        self.verify_with_policy(token, expected, self.failure_policy)
            .await
    }

    async fn verify_with_policy(
        &self,
        token: &str,
        expected: TokenKind,
        policy: StoreFailurePolicy,
    ) -> AppResult<Claims> {
        let claims = self.decode(token)?;

        if claims.is_expired_at(self.clock.now_secs()) {
            return Err(AppError::ExpiredToken);
        }

        if claims.kind != expected {
            return Err(AppError::WrongTokenKind {
                expected,
                actual: claims.kind,
            });
        }

        match self.revocations.contains(&claims.jti).await {
            Ok(false) => Ok(claims),
            Ok(true) => Err(AppError::RevokedToken),
            Err(e) => match policy {
                StoreFailurePolicy::FailClosed => Err(e.into()),
                StoreFailurePolicy::FailOpen => {
                    tracing::error!(
                        jti = %claims.jti,
                        error = %e,
                        "Revocation store unavailable, admitting token under fail-open policy"
                    );
                    metrics::record_store_failure("revocation_lookup");
                    Ok(claims)
                }
            },
        }
    }

    /// Revoke a token until its natural expiry.
    ///
    /// The token must carry a valid signature. Revoking an already expired
    /// token is a no-op since it can no longer verify.
    pub async fn revoke(&self, token: &str) -> AppResult<()> {
        let claims = self.decode(token)?;
        self.revoke_claims(&claims).await.map(|_| ())
    }

    /// Revoke by claims. Returns `false` if the token was already revoked or
    /// has already expired.
    pub async fn revoke_claims(&self, claims: &Claims) -> AppResult<bool> {
        let remaining = claims.remaining_lifetime_secs(self.clock.now_secs());
        if remaining == 0 {
            tracing::debug!(jti = %claims.jti, "Token already expired, nothing to revoke");
            return Ok(false);
        }

        let inserted = self
            .revocations
            .insert(&claims.jti, Duration::from_secs(remaining))
            .await?;

        if inserted {
            metrics::record_token_revoked();
            tracing::info!(jti = %claims.jti, sub = %claims.sub, ttl_secs = remaining, "Token revoked");
        }
        Ok(inserted)
    }

    /// Spend a refresh token and issue a new pair.
    ///
    /// The old refresh token is revoked with insert-if-absent before the new
    /// pair is minted, so of two concurrent refreshes with the same token
    /// exactly one succeeds. Scopes are carried over unchanged.
    pub async fn refresh(&self, refresh_token: &str) -> AppResult<TokenPair> {
        let claims = self
            .verify_with_policy(
                refresh_token,
                TokenKind::Refresh,
                StoreFailurePolicy::FailClosed,
            )
            .await?;

        if !self.revoke_claims(&claims).await? {
            tracing::warn!(jti = %claims.jti, sub = %claims.sub, "Refresh token replayed");
            return Err(AppError::RevokedToken);
        }

        self.issue_pair(&claims.sub, claims.scopes)
    }
}

fn map_decode_error(err: jsonwebtoken::errors::Error) -> AppError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => AppError::ExpiredToken,
        _ => AppError::InvalidSignature(err.to_string()),
    }
}
