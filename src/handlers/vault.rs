//! Payload encryption endpoints.
//!
//! # Endpoints
//!
//! - `POST /vault/encrypt` - Encrypt under the current DEK
//! - `POST /vault/decrypt` - Verify and decrypt a payload produced earlier
//!
//! # Payload Format
//!
//! ```json
//! { "kid": "<uuid>", "iv": "<b64>", "ct": "<b64>", "tag": "<b64>" }
//! ```

use axum::Json;
use axum::extract::State;
use tracing::instrument;

use crate::crypto::{EncryptedPayload, decode_b64, encode_b64};
use crate::error::{AppError, AppResult};
use crate::models::{DecryptResponse, EncryptRequest};
use crate::state::AppState;

/// Encrypt a plaintext.
///
/// # Request Body
///
/// ```json
/// { "plaintext": "hello" }
/// ```
///
/// or, for binary data, `{ "plaintext_b64": "aGVsbG8=" }`.
#[instrument(skip_all)]
pub async fn encrypt(
    State(state): State<AppState>,
    Json(body): Json<EncryptRequest>,
) -> AppResult<Json<EncryptedPayload>> {
    let plaintext = match (body.plaintext, body.plaintext_b64) {
        (Some(text), None) => text.into_bytes(),
        (None, Some(encoded)) => decode_b64(&encoded)
            .map_err(|_| AppError::BadRequest("plaintext_b64 is not valid base64".to_string()))?,
        _ => {
            return Err(AppError::BadRequest(
                "Exactly one of plaintext or plaintext_b64 is required".to_string(),
            ));
        }
    };

    let payload = state.keys.encrypt(&plaintext)?;
    Ok(Json(payload))
}

/// Decrypt a payload.
///
/// Every failure (unknown key, tampering, wrong key) reads the same to the
/// client.
#[instrument(skip_all)]
pub async fn decrypt(
    State(state): State<AppState>,
    Json(payload): Json<EncryptedPayload>,
) -> AppResult<Json<DecryptResponse>> {
    // An unknown kid reloads the keyring from disk
    let keys = state.keys.clone();
    let plaintext = tokio::task::spawn_blocking(move || keys.decrypt(&payload))
        .await
        .map_err(|e| AppError::Internal(format!("Decryption task failed: {e}")))??;

    Ok(Json(DecryptResponse {
        plaintext_b64: encode_b64(&plaintext),
        plaintext: String::from_utf8(plaintext).ok(),
    }))
}
