pub mod admin;
pub mod auth;
mod health;
pub mod vault;

pub use health::{health_check, readiness_check};
