//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness, always 200
//! - `GET /ready` - 503 until the shared store answers
//!
//! Both are public by default (`AUTH_PUBLIC_PATHS`).

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::models::{HealthResponse, ReadinessResponse};
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "store_backend": "memory",
///   "keyring_keys": 2,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_backend: state.store.backend().to_string(),
        keyring_keys: state.keys.list_keys().len(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// Not ready while the revocation and rate-limit store is unreachable,
/// whatever the failure policy: a fail-open instance is still degraded.
///
/// ```yaml
/// readinessProbe:
///   httpGet:
///     path: /ready
///     port: 3000
/// ```
#[instrument(skip(state))]
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                ready: true,
                store_reachable: true,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check: store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    ready: false,
                    store_reachable: false,
                }),
            )
        }
    }
}
