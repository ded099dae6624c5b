//! HTTP middleware enforcing the security pipeline.
//!
//! - **Pipeline**: validation, authentication, authorization and rate
//!   limiting as one tower layer with a configurable stage order
//! - **Client IP**: forwarding-header resolution with CIDR-based trusted
//!   proxy validation
//!
//! # Architecture
//!
//! ```text
//! Request → CORS → Trace → SecurityLayer → Handler → Response
//!                              ↓
//!                 400 / 401 / 403 / 413 / 429 / 503
//! ```

pub mod ip;
pub mod pipeline;

pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use pipeline::{
    PipelineSettings, RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, SecurityLayer,
    SecurityPipeline, SecurityService, Stage,
};
