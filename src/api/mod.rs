/// HTTP API Layer
///
/// Thin REST surface over the coordination core:
/// - Workflow creation and reads, with derived lock state and progress
/// - Step transitions, checklist and quiz updates, assignment
/// - Invite grant issue, validation and redemption

// Shared state and bearer authentication
pub mod state;

// Workflow and step endpoints
pub mod workflows;

// Invite grant endpoints
pub mod invites;

use axum::Router;

pub use state::{AppState, Authenticated};
pub use invites::create_invite_routes;
pub use workflows::create_workflow_routes;

/// Every REST route, ready for state
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .merge(create_workflow_routes())
        .merge(create_invite_routes())
}
