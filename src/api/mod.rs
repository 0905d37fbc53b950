//! HTTP API.
//!
//! Routes are grouped by guard (open, data, admin) in `router.rs`;
//! `server.rs` binds and serves them with peer addresses attached.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;

pub use router::api_router;
pub use server::{serve, shutdown_signal, start_server, ApiServer, ServerError, ServerInfo};
pub use types::ApiContext;
