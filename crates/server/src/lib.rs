//! HTTP API layer for the Stratus scheduler.
//!
//! Thin shell over [`stratus_core::Scheduler`]: routing, bearer-token
//! middleware, request/response shaping, and the reqwest-based transports the
//! scheduler uses to call back into nodes.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
pub mod transport;
