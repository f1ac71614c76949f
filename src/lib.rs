/// Onboardflow: real-time coordination core for onboarding workflows
///
/// Gated step progression, single-use invite grants and fire-and-forget
/// notification fan-out to every live channel of an identity.

// Core configuration and setup
pub mod config;

// Structured error taxonomy
pub mod error;

// Workflow management layer - definitions, storage, registry and step progression
pub mod workflow;

// Invite grants and workflow entitlements
pub mod access;

// Connection registry, dispatcher and background notification tasks
pub mod realtime;

// WebSocket gateway and token verification
pub mod gateway;

// HTTP API layer - REST endpoints over the core
pub mod api;

// Server setup and initialization
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types for external consumers
pub use access::{AccessGrantStore, InviteGrant};
pub use realtime::{ConnectionRegistry, NotificationDispatcher, NotificationEvent};
pub use server::start_server;
pub use workflow::{StepProgressionEngine, Workflow, WorkflowStep};
