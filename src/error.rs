/// Structured error taxonomy for the coordination core
///
/// Every error raised inside the core carries a kind and enough context to explain
/// itself. Transport and storage failures never leak through these types; the REST
/// surface maps each kind onto a stable status code and machine-readable name.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

/// Step Progression Engine failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// A preceding step is not completed yet
    #[error("step '{step_id}' at position {index} of workflow '{workflow_id}' is locked until all previous steps are completed")]
    LockedStep {
        workflow_id: String,
        step_id: String,
        index: usize,
    },

    /// The requested status change breaks monotonicity or an unmet completion gate
    #[error("invalid transition for step '{step_id}' from {from} to {to}: {reason}")]
    InvalidTransition {
        step_id: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("step '{step_id}' not found in workflow '{workflow_id}'")]
    StepNotFound { workflow_id: String, step_id: String },

    /// Todo or quiz question index out of range
    #[error("{kind} #{index} not found on step '{step_id}'")]
    SubItemNotFound {
        step_id: String,
        kind: &'static str,
        index: usize,
    },
}

/// Access Grant Store failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrantError {
    #[error("no pending invitation matches this email and code")]
    GrantNotFound { email: String },

    /// Kept distinct from not-found so users can be told to ask for a fresh code
    #[error("invitation for '{email}' to workflow '{workflow_id}' has expired")]
    ExpiredGrant { email: String, workflow_id: String },

    #[error("invitation for '{email}' to workflow '{workflow_id}' was already redeemed by another account")]
    AlreadyRedeemed { email: String, workflow_id: String },
}

/// Connect-time authentication failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,

    #[error("Invalid authentication token")]
    InvalidToken(String),
}

/// Per-channel send failure, always recovered inside the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchFailure {
    #[error("channel {channel_id} of '{identity}' is closed")]
    ChannelClosed { identity: String, channel_id: String },

    #[error("channel {channel_id} of '{identity}' is full, dropping message")]
    ChannelFull { identity: String, channel_id: String },
}

/// Failure of a persisted engine operation
#[derive(Debug, Error)]
pub enum ProgressionError {
    #[error(transparent)]
    Step(#[from] StepError),

    #[error("failed to persist workflow: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Failure of a persisted access operation
#[derive(Debug, Error)]
pub enum AccessError {
    #[error(transparent)]
    Grant(#[from] GrantError),

    /// The grant points at a workflow that no longer exists
    #[error("workflow '{0}' not found")]
    WorkflowGone(String),

    #[error("failed to persist access record: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Error type returned by the REST surface
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Grant(#[from] GrantError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("not allowed to access workflow '{0}'")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ProgressionError> for ApiError {
    fn from(err: ProgressionError) -> Self {
        match err {
            ProgressionError::Step(step) => ApiError::Step(step),
            ProgressionError::Storage(source) => ApiError::Internal(source),
        }
    }
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Grant(grant) => ApiError::Grant(grant),
            AccessError::WorkflowGone(workflow_id) => ApiError::Step(StepError::WorkflowNotFound(workflow_id)),
            AccessError::Storage(source) => ApiError::Internal(source),
        }
    }
}

impl ApiError {
    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Step(StepError::LockedStep { .. }) => "locked_step",
            ApiError::Step(StepError::InvalidTransition { .. }) => "invalid_transition",
            ApiError::Step(StepError::WorkflowNotFound(_)) => "workflow_not_found",
            ApiError::Step(StepError::StepNotFound { .. }) => "step_not_found",
            ApiError::Step(StepError::SubItemNotFound { .. }) => "sub_item_not_found",
            ApiError::Grant(GrantError::GrantNotFound { .. }) => "grant_not_found",
            ApiError::Grant(GrantError::ExpiredGrant { .. }) => "expired_grant",
            ApiError::Grant(GrantError::AlreadyRedeemed { .. }) => "already_redeemed",
            ApiError::Auth(AuthError::MissingToken) => "missing_token",
            ApiError::Auth(AuthError::InvalidToken(_)) => "invalid_token",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Step(StepError::WorkflowNotFound(_))
            | ApiError::Step(StepError::StepNotFound { .. })
            | ApiError::Step(StepError::SubItemNotFound { .. })
            | ApiError::Grant(GrantError::GrantNotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Step(StepError::LockedStep { .. })
            | ApiError::Step(StepError::InvalidTransition { .. })
            | ApiError::Grant(GrantError::AlreadyRedeemed { .. }) => StatusCode::CONFLICT,
            ApiError::Grant(GrantError::ExpiredGrant { .. }) => StatusCode::GONE,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("❌ Internal error while serving request: {:#}", self);
        } else {
            tracing::debug!("↩️ Request rejected ({}): {}", self.kind(), self);
        }

        // Internal details stay in the logs
        let message = match &self {
            ApiError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}
