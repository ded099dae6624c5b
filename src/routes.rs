//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Preflight answered here, before any credential check
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response spans
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  SecurityLayer   │ ← validate → authenticate → authorize → rate_limit
//! └────────┬─────────┘   (order from PIPELINE_ORDER)
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Probes (public)
//! - `/auth/*` - Token refresh, revocation, introspection
//! - `/vault/*` - Payload encryption
//! - `/admin/keys*` - Keyring administration

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::SecurityLayer;
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let pipeline = Arc::new(state.pipeline());
    info!(
        order = ?config.pipeline_order,
        validation_mode = %config.validation_mode,
        rate_limiting = state.limiter.is_some(),
        public_paths = ?config.auth_public_paths,
        "Security pipeline configured"
    );
    if !config.proxy_validation_enabled() {
        info!("TRUSTED_PROXIES not set, forwarding headers are trusted from any source");
    }

    let cors = build_cors_layer(&config.cors_allowed_origins);
    let body_limit = DefaultBodyLimit::max(config.max_request_body_size);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/revoke", post(handlers::auth::revoke))
        .route("/auth/whoami", get(handlers::auth::whoami))
        .route("/vault/encrypt", post(handlers::vault::encrypt))
        .route("/vault/decrypt", post(handlers::vault::decrypt))
        .route("/admin/keys", get(handlers::admin::list_keys))
        .route("/admin/keys/rotate", post(handlers::admin::rotate_key))
        // Applied bottom to top: the last layer added sees the request first
        .layer(body_limit)
        .layer(SecurityLayer::new(pipeline))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Build CORS layer from configuration.
///
/// `["*"]` allows any origin. Specify explicit origins in production.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
