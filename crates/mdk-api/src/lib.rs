//! mdk-api library target.
//!
//! Exposes the router, state, and error mapping for integration tests.
//! The binary `main.rs` depends on this library target.

pub mod api_types;
pub mod error;
pub mod routes;
pub mod state;
