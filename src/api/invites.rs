/// Invite grant endpoints
///
/// Managers issue 6-digit codes per (workflow, email); invitees check a code
/// before signing in and redeem it once authenticated. Every change to a grant or
/// entitlement is written through to storage by the access ledger.

use crate::{
    access::types::{normalize_email, InviteGrant},
    api::{
        state::{AppState, Authenticated},
        workflows::require_manager,
    },
    error::{ApiError, StepError},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct CreateInviteRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct InviteCodeRequest {
    pub email: String,
    pub code: String,
}

pub fn create_invite_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/invites", post(create_invite).get(list_invites))
        .route("/api/invites/validate", post(validate_invite))
        .route("/api/invites/redeem", post(redeem_invite))
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.ends_with('.'),
        None => false,
    }
}

/// POST /api/workflows/{id}/invites
/// Body: { "email": "new.hire@example.com" }
async fn create_invite(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
    Json(payload): Json<CreateInviteRequest>,
) -> Result<(StatusCode, Json<InviteGrant>), ApiError> {
    require_manager(&caller)?;
    let email = normalize_email(&payload.email);
    if !looks_like_email(&email) {
        return Err(ApiError::BadRequest(format!("'{}' is not a valid email address", payload.email)));
    }
    if state.registry.handle(&id).is_none() {
        return Err(StepError::WorkflowNotFound(id).into());
    }

    let grant = state.access.issue(&id, &email).await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

/// GET /api/workflows/{id}/invites
async fn list_invites(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_manager(&caller)?;
    Ok(Json(json!({ "invites": state.grants.grants_for_workflow(&id) })))
}

/// POST /api/invites/validate
///
/// Unauthenticated: the invitee checks the code before signing in. Expired
/// codes are reported distinctly from unknown ones.
async fn validate_invite(
    State(state): State<AppState>,
    Json(payload): Json<InviteCodeRequest>,
) -> Result<Json<Value>, ApiError> {
    let grant = state.access.validate(&payload.email, payload.code.trim()).await?;
    Ok(Json(json!({
        "workflowId": grant.workflow_id,
        "email": grant.email,
        "expiresAt": grant.expires_at,
    })))
}

/// POST /api/invites/redeem
/// Body: { "email": "...", "code": "123456" }
async fn redeem_invite(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(payload): Json<InviteCodeRequest>,
) -> Result<Json<Value>, ApiError> {
    let email = normalize_email(&payload.email);
    if let Some(own) = caller.email.as_deref() {
        if normalize_email(own) != email {
            return Err(ApiError::Forbidden(format!("invitation is addressed to '{}'", email)));
        }
    }

    let registry = &state.registry;
    let entitlement = state
        .access
        .redeem(&email, payload.code.trim(), &caller.user_id, |workflow_id| {
            registry.handle(workflow_id).is_some()
        })
        .await?;
    Ok(Json(json!({ "entitlement": entitlement })))
}
