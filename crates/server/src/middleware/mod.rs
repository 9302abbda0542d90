pub mod auth;

pub use auth::{require_permission, CallerIdentity, RequiredPerm};
