/// Shared application state and the bearer-auth extractor

use crate::{
    access::{ledger::AccessLedger, store::AccessGrantStore, types::Identity},
    error::ApiError,
    gateway::auth::{bearer_token, IdentityVerifier},
    realtime::{dispatcher::NotificationDispatcher, registry::ConnectionRegistry},
    workflow::{progression::StepProgressionEngine, registry::WorkflowRegistry},
};
use axum::{extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;
use tokio::sync::watch;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// In-memory workflows with per-instance writer locks
    pub registry: Arc<WorkflowRegistry>,
    /// Gated step transitions
    pub engine: StepProgressionEngine,
    /// Invite grants and entitlements, for reads
    pub grants: Arc<AccessGrantStore>,
    /// Write-through grant and entitlement changes over `grants`
    pub access: Arc<AccessLedger>,
    /// Identity → live channels
    pub connections: Arc<ConnectionRegistry>,
    /// The process-wide dispatcher
    pub dispatcher: NotificationDispatcher,
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Outbound queue capacity per live channel
    pub channel_buffer: usize,
    /// Flips to true when the process is shutting down
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Fail with Forbidden unless `identity` may see the workflow
    pub fn ensure_access(&self, workflow_id: &str, identity: &Identity) -> Result<(), ApiError> {
        if self.grants.has_access(workflow_id, identity) {
            Ok(())
        } else {
            tracing::debug!(workflow_id, user_id = %identity.user_id, "🚫 Access denied");
            Err(ApiError::Forbidden(workflow_id.to_string()))
        }
    }
}

/// Identity verified from the request's bearer token
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        let identity = state.verifier.verify(token)?;
        Ok(Authenticated(identity))
    }
}
