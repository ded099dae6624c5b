//! Token lifecycle endpoints.
//!
//! # Endpoints
//!
//! - `POST /auth/refresh` - Spend a refresh token for a new pair (public;
//!   the refresh token in the body is the credential)
//! - `POST /auth/revoke` - Revoke a token until its expiry
//! - `GET /auth/whoami` - The authenticated principal

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::authz::{Principal, require_scopes};
use crate::error::AppResult;
use crate::metrics;
use crate::models::{RefreshRequest, RevokeRequest, RevokeResponse, WhoAmIResponse};
use crate::state::AppState;
use crate::token::TokenPair;

/// Scope allowing a caller to revoke tokens it does not own.
pub const REVOKE_ANY_SCOPE: &str = "admin";

/// Rotate a refresh token.
///
/// The presented token is revoked before the new pair is issued; replaying
/// it afterwards yields 401.
///
/// # Request Body
///
/// ```json
/// { "refresh_token": "eyJ..." }
/// ```
#[instrument(skip_all)]
pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> AppResult<Json<TokenPair>> {
    let pair = state
        .tokens
        .refresh(&body.refresh_token)
        .await
        .inspect_err(|e| {
            if e.is_token_error() {
                metrics::record_auth_failure(e.reason());
                warn!(reason = e.reason(), "Refresh rejected");
            }
        })?;

    Ok(Json(pair))
}

/// Revoke a token.
///
/// Callers may revoke their own tokens. Revoking someone else's requires
/// the `admin` scope. The token must carry a valid signature; expired tokens
/// are accepted and reported as not revoked.
#[instrument(skip_all, fields(sub = %principal.subject))]
pub async fn revoke(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<RevokeRequest>,
) -> AppResult<Json<RevokeResponse>> {
    let claims = state.tokens.decode(&body.token)?;

    if claims.sub != principal.subject {
        require_scopes(&principal, &[REVOKE_ANY_SCOPE])?;
        info!(target_sub = %claims.sub, jti = %claims.jti, "Revoking another subject's token");
    }

    let revoked = state.tokens.revoke_claims(&claims).await?;
    Ok(Json(RevokeResponse { revoked }))
}

/// Describe the authenticated caller.
#[instrument(skip_all, fields(sub = %principal.subject))]
pub async fn whoami(principal: Principal) -> Json<WhoAmIResponse> {
    Json(WhoAmIResponse {
        expires_at: DateTime::<Utc>::from_timestamp(principal.expires_at, 0).unwrap_or_default(),
        subject: principal.subject,
        scopes: principal.scopes,
    })
}
