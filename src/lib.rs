//! # Gatekeeper
//!
//! Security middleware core for HTTP services built on Axum:
//!
//! - **Tokens**: signed access/refresh tokens with revocation and
//!   single-use refresh rotation
//! - **Authorization**: scope checks against a role table frozen at issuance
//! - **Rate Limiting**: fixed and sliding windows over a shared atomic store
//! - **Encryption**: two-tier keyring (master key → DEKs) with
//!   encrypt-then-MAC payloads and non-destructive rotation
//! - **Input Validation**: injection pattern scanning of URLs, queries and
//!   bodies
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CORS → Trace → SecurityLayer                               │
//! │    (validate → authenticate → authorize → rate_limit)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, auth, vault, admin)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TokenService · RateLimiter · KeyManager · InputValidator   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  StoreHandle (in-memory DashMap | Redis)   Keyring file     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gatekeeper::{AppState, Config, build_router};
//! use gatekeeper::clock::SystemClock;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::from_config(config, SystemClock::shared()).await?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Required Secrets
//!
//! ```bash
//! JWT_SECRET_KEY=$(openssl rand -hex 32) MASTER_KEY=... cargo run
//! ```

pub mod authz;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod ratelimit;
pub mod routes;
pub mod state;
pub mod store;
pub mod token;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;
