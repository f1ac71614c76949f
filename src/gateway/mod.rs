/// Real-time gateway
///
/// Token verification and the WebSocket session handler.

// Identity/Auth collaborator
pub mod auth;

// WebSocket endpoint and per-connection lifecycle
pub mod session;

pub use auth::{IdentityVerifier, JwtVerifier};
pub use session::ws_handler;
