//! Keyring administration.
//!
//! # Endpoints
//!
//! - `GET /admin/keys` - Key ids and ages, never key material
//! - `POST /admin/keys/rotate` - Make a new DEK current
//!
//! Both require the `admin:keys` scope under the default `ROUTE_SCOPES`.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use tracing::{info, instrument};

use crate::authz::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{KeysResponse, RotateResponse};
use crate::state::AppState;

#[instrument(skip_all)]
pub async fn list_keys(State(state): State<AppState>) -> Json<KeysResponse> {
    Json(KeysResponse {
        current: state.keys.current_key_id(),
        keys: state.keys.list_keys(),
    })
}

/// Rotate the current DEK. Existing payloads stay decryptable.
#[instrument(skip_all, fields(sub = %principal.subject))]
pub async fn rotate_key(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<(StatusCode, Json<RotateResponse>)> {
    let keys = state.keys.clone();
    let current = tokio::task::spawn_blocking(move || keys.rotate())
        .await
        .map_err(|e| AppError::Internal(format!("Rotation task failed: {e}")))??;

    info!(kid = %current, "Key rotated on request");
    Ok((
        StatusCode::CREATED,
        Json(RotateResponse {
            current,
            keys: state.keys.list_keys().len(),
        }),
    ))
}
