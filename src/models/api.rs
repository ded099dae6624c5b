use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::KeyInfo;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy"
    pub status: String,
    /// Crate version
    pub version: String,
    /// Store backend in use ("memory" or "redis")
    pub store_backend: String,
    /// DEKs currently held in the keyring
    pub keyring_keys: usize,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

/// Readiness probe response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub store_reachable: bool,
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Body of `POST /auth/revoke`.
#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    /// Token to revoke, access or refresh
    pub token: String,
}

/// Response after a revocation request.
#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeResponse {
    /// `false` if the token was already revoked or had already expired
    pub revoked: bool,
}

/// The caller as seen by the pipeline.
#[derive(Debug, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    pub subject: String,
    pub scopes: BTreeSet<String>,
    pub expires_at: DateTime<Utc>,
}

/// Body of `POST /vault/encrypt`.
///
/// Exactly one of the two fields must be set.
#[derive(Debug, Deserialize)]
pub struct EncryptRequest {
    /// UTF-8 plaintext
    #[serde(default)]
    pub plaintext: Option<String>,
    /// Base64 plaintext, for binary data
    #[serde(default)]
    pub plaintext_b64: Option<String>,
}

/// Response of `POST /vault/decrypt`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptResponse {
    /// Plaintext as UTF-8, when it is valid UTF-8
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plaintext: Option<String>,
    /// Plaintext as base64, always present
    pub plaintext_b64: String,
}

/// Response of `GET /admin/keys`.
#[derive(Debug, Serialize)]
pub struct KeysResponse {
    pub current: String,
    pub keys: Vec<KeyInfo>,
}

/// Response of `POST /admin/keys/rotate`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RotateResponse {
    /// Id of the new current key
    pub current: String,
    /// Total keys retained after rotation
    pub keys: usize,
}
