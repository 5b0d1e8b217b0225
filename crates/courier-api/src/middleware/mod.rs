//! HTTP middleware for authentication and request tracking.

pub mod auth;

pub use auth::{auth_middleware, require_scope};
