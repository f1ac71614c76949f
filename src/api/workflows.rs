/// Workflow and step progression REST endpoints
///
/// Thin handlers over the registry and the progression engine. Every route is
/// bearer-authenticated; reads and step mutations additionally require access to
/// the workflow, and structural changes are reserved for admins and managers.

use crate::{
    access::types::{EntitlementRole, Identity},
    api::state::{AppState, Authenticated},
    error::{ApiError, StepError},
    realtime::events::WorkflowAction,
    workflow::{
        progression::{is_unlocked, progress},
        types::{Progress, StepContent, StepStatus, Workflow, WorkflowRules, WorkflowStatus, WorkflowStep},
    },
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Request body for workflow creation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: WorkflowRules,
    #[serde(default)]
    pub steps: Vec<NewStep>,
    /// Activate immediately; step deadlines start counting now
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStep {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Days after the workflow starts; must be at least 1
    pub due_in_days: u32,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub content: StepContent,
}

/// Workflow as seen by a client, with the derived lock state of each step
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowView {
    pub workflow: Workflow,
    pub unlocked: Vec<bool>,
    pub progress: Progress,
}

impl From<Workflow> for WorkflowView {
    fn from(workflow: Workflow) -> Self {
        let unlocked = (0..workflow.steps.len()).map(|i| is_unlocked(&workflow, i)).collect();
        let progress = progress(&workflow);
        Self {
            workflow,
            unlocked,
            progress,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub status: StepStatus,
}

#[derive(Debug, Deserialize)]
pub struct TodoRequest {
    pub completed: bool,
}

#[derive(Debug, Deserialize)]
pub struct QuizAnswerRequest {
    pub answer: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub identity: String,
}

/// Create workflow and step routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}", delete(delete_workflow))
        .route("/api/workflows/{id}/progress", get(get_progress))
        .route("/api/workflows/{id}/steps/{step_id}/transition", post(transition_step))
        .route("/api/workflows/{id}/steps/{step_id}/todos/{index}", post(set_todo))
        .route("/api/workflows/{id}/steps/{step_id}/quiz/{index}", post(answer_quiz))
        .route("/api/workflows/{id}/steps/{step_id}/assignees", post(assign_step))
}

pub(crate) fn require_manager(identity: &Identity) -> Result<(), ApiError> {
    if identity.role.bypasses_entitlements() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("admin or manager role required".to_string()))
    }
}

/// Give an assignee durable participant access
async fn entitle_assignee(state: &AppState, workflow_id: &str, identity: &str) -> Result<(), ApiError> {
    state
        .access
        .entitle(workflow_id, identity, EntitlementRole::Participant)
        .await?;
    Ok(())
}

/// POST /api/workflows
async fn create_workflow(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowView>), ApiError> {
    require_manager(&caller)?;

    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("workflow name is required".to_string()));
    }
    if payload.rules.required_quiz_score.map(|s| s > 100).unwrap_or(false) {
        return Err(ApiError::BadRequest("requiredQuizScore must be between 0 and 100".to_string()));
    }

    let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    if state.registry.handle(&id).is_some() {
        return Err(ApiError::BadRequest(format!("workflow '{}' already exists", id)));
    }

    let mut workflow = Workflow::new(id.clone(), payload.name);
    workflow.description = payload.description;
    workflow.rules = payload.rules;
    for new_step in payload.steps {
        let step_id = new_step.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if workflow.step_index(&step_id).is_some() {
            return Err(ApiError::BadRequest(format!("duplicate step id '{}'", step_id)));
        }
        if new_step.due_in_days == 0 {
            return Err(ApiError::BadRequest(format!(
                "step '{}' needs a positive dueInDays",
                step_id
            )));
        }
        let mut step = WorkflowStep::new(step_id, new_step.title, 0, new_step.due_in_days);
        step.description = new_step.description;
        step.assignees = new_step.assignees.into_iter().collect();
        step.content = new_step.content;
        workflow.push_step(step);
    }
    if payload.start {
        workflow.status = WorkflowStatus::Active;
        workflow.started_at = Some(Utc::now());
    }

    state.registry.upsert(workflow.clone()).await?;

    let participants = workflow.participants();
    for identity in &participants {
        entitle_assignee(&state, &id, identity).await?;
        state.dispatcher.notify_new_assignment(identity, &id);
    }
    state.dispatcher.notify_workflow_update(None, &id, WorkflowAction::Created);

    tracing::info!(
        workflow_id = %id,
        steps = workflow.steps.len(),
        participants = participants.len(),
        "🔥 Created workflow"
    );
    Ok((StatusCode::CREATED, Json(workflow.into())))
}

/// GET /api/workflows
///
/// Only workflows the caller can access are listed.
async fn list_workflows(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> Json<Value> {
    let mut workflows: Vec<Value> = state
        .registry
        .snapshot_all()
        .await
        .into_iter()
        .filter(|wf| state.grants.has_access(&wf.id, &caller))
        .map(|wf| {
            json!({
                "id": wf.id,
                "name": wf.name,
                "status": wf.status,
                "progress": progress(&wf),
            })
        })
        .collect();
    workflows.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    Json(json!({ "workflows": workflows }))
}

async fn load_visible(state: &AppState, workflow_id: &str, caller: &Identity) -> Result<Workflow, ApiError> {
    state.ensure_access(workflow_id, caller)?;
    state
        .registry
        .snapshot(workflow_id)
        .await
        .ok_or_else(|| StepError::WorkflowNotFound(workflow_id.to_string()).into())
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<Json<WorkflowView>, ApiError> {
    let workflow = load_visible(&state, &id, &caller).await?;
    Ok(Json(workflow.into()))
}

/// GET /api/workflows/{id}/progress
async fn get_progress(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<Json<Progress>, ApiError> {
    state.ensure_access(&id, &caller)?;
    Ok(Json(state.engine.progress(&id).await?))
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_manager(&caller)?;
    if !state.registry.remove(&id).await? {
        return Err(StepError::WorkflowNotFound(id).into());
    }
    // Outstanding invites and entitlements must not carry over to a later workflow with this id
    state.access.forget_workflow(&id).await?;
    state.dispatcher.notify_workflow_update(None, &id, WorkflowAction::Deleted);
    tracing::info!(workflow_id = %id, "🗑️ Deleted workflow");
    Ok(Json(json!({ "message": format!("Workflow '{}' deleted successfully", id) })))
}

/// POST /api/workflows/{id}/steps/{step_id}/transition
/// Body: { "status": "pending" | "in-progress" | "completed" }
async fn transition_step(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path((id, step_id)): Path<(String, String)>,
    Json(payload): Json<TransitionRequest>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_access(&id, &caller)?;
    let outcome = state.engine.transition(&id, &step_id, payload.status).await?;
    Ok(Json(json!({
        "stepId": outcome.step_id,
        "from": outcome.from,
        "to": outcome.to,
        "changed": outcome.changed,
    })))
}

/// POST /api/workflows/{id}/steps/{step_id}/todos/{index}
/// Body: { "completed": true }
async fn set_todo(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path((id, step_id, index)): Path<(String, String, usize)>,
    Json(payload): Json<TodoRequest>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_access(&id, &caller)?;
    state.engine.set_todo(&id, &step_id, index, payload.completed).await?;
    Ok(Json(json!({ "stepId": step_id, "index": index, "completed": payload.completed })))
}

/// POST /api/workflows/{id}/steps/{step_id}/quiz/{index}
/// Body: { "answer": "..." }
async fn answer_quiz(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path((id, step_id, index)): Path<(String, String, usize)>,
    Json(payload): Json<QuizAnswerRequest>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_access(&id, &caller)?;
    let score = state
        .engine
        .record_quiz_answer(&id, &step_id, index, &payload.answer)
        .await?;
    Ok(Json(json!({ "stepId": step_id, "index": index, "score": score })))
}

/// POST /api/workflows/{id}/steps/{step_id}/assignees
/// Body: { "identity": "user-id" }
async fn assign_step(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path((id, step_id)): Path<(String, String)>,
    Json(payload): Json<AssignRequest>,
) -> Result<Json<Value>, ApiError> {
    require_manager(&caller)?;
    let identity = payload.identity.trim();
    if identity.is_empty() {
        return Err(ApiError::BadRequest("identity is required".to_string()));
    }

    let added = state.engine.assign(&id, &step_id, identity).await?;
    entitle_assignee(&state, &id, identity).await?;
    Ok(Json(json!({ "stepId": step_id, "identity": identity, "added": added })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::types::UserRole,
        test_support::{identity, test_state, token_for, Harness},
    };
    use axum::{
        body::Body,
        http::{header, Request},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn call(harness: &Harness, method: &str, uri: &str, who: &Identity, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token_for(who)))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = create_workflow_routes()
            .with_state(harness.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn onboarding() -> Value {
        json!({
            "id": "wf-1",
            "name": "Engineering onboarding",
            "start": true,
            "steps": [
                { "id": "a", "title": "Welcome", "dueInDays": 1, "assignees": ["u-1"] },
                {
                    "id": "b",
                    "title": "Paperwork",
                    "dueInDays": 3,
                    "assignees": ["u-1"],
                    "content": { "todos": [{ "text": "Sign contract", "required": true }] }
                }
            ]
        })
    }

    #[tokio::test]
    async fn only_managers_create_workflows() {
        let harness = test_state().await;
        let hire = identity("u-1", UserRole::NewHire);
        let (status, body) = call(&harness, "POST", "/api/workflows", &hire, onboarding()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["kind"], "forbidden");

        let manager = identity("m-1", UserRole::Manager);
        let (status, body) = call(&harness, "POST", "/api/workflows", &manager, onboarding()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["unlocked"], json!([true, false]));
        assert_eq!(body["workflow"]["steps"][1]["position"], 1);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let harness = test_state().await;
        let request = Request::builder()
            .uri("/api/workflows/wf-1")
            .body(Body::empty())
            .unwrap();
        let response = create_workflow_routes()
            .with_state(harness.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn assignees_progress_through_gated_steps() {
        let mut harness = test_state().await;
        let manager = identity("m-1", UserRole::Manager);
        let hire = identity("u-1", UserRole::NewHire);
        let outsider = identity("u-9", UserRole::NewHire);
        call(&harness, "POST", "/api/workflows", &manager, onboarding()).await;

        let (status, _) = call(&harness, "GET", "/api/workflows/wf-1", &outsider, Value::Null).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &harness,
            "POST",
            "/api/workflows/wf-1/steps/b/transition",
            &hire,
            json!({ "status": "completed" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "locked_step");

        let (status, body) = call(
            &harness,
            "POST",
            "/api/workflows/wf-1/steps/a/transition",
            &hire,
            json!({ "status": "completed" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["to"], "completed");

        let (status, body) = call(
            &harness,
            "POST",
            "/api/workflows/wf-1/steps/b/transition",
            &hire,
            json!({ "status": "completed" }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "invalid_transition");

        let (status, _) = call(
            &harness,
            "POST",
            "/api/workflows/wf-1/steps/b/todos/0",
            &hire,
            json!({ "completed": true }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        call(
            &harness,
            "POST",
            "/api/workflows/wf-1/steps/b/transition",
            &hire,
            json!({ "status": "completed" }),
        )
        .await;

        let (_, progress) = call(&harness, "GET", "/api/workflows/wf-1/progress", &hire, Value::Null).await;
        assert_eq!(progress, json!({ "completed": 2, "total": 2, "percent": 100 }));
        assert!(harness.pump() >= 4);
    }

    #[tokio::test]
    async fn assignment_grants_access_and_notifies() {
        let mut harness = test_state().await;
        let manager = identity("m-1", UserRole::Manager);
        call(&harness, "POST", "/api/workflows", &manager, onboarding()).await;

        let (tab, mut rx) = crate::realtime::registry::ChannelHandle::new("u-2", 4);
        harness.state.connections.register(tab);

        let (status, body) = call(
            &harness,
            "POST",
            "/api/workflows/wf-1/steps/a/assignees",
            &manager,
            json!({ "identity": "u-2" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"], true);
        assert!(harness.state.grants.has_access("wf-1", &identity("u-2", UserRole::NewHire)));

        harness.pump();
        assert_eq!(rx.try_recv().unwrap().kind, "NEW_ASSIGNMENT");
    }

    #[tokio::test]
    async fn steps_need_a_positive_deadline() {
        let harness = test_state().await;
        let manager = identity("m-1", UserRole::Manager);

        let mut zero = onboarding();
        zero["steps"][1]["dueInDays"] = json!(0);
        let (status, body) = call(&harness, "POST", "/api/workflows", &manager, zero).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("'b'"));

        let mut missing = onboarding();
        missing["steps"][0].as_object_mut().unwrap().remove("dueInDays");
        let (status, _) = call(&harness, "POST", "/api/workflows", &manager, missing).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        assert!(harness.state.registry.handle("wf-1").is_none());
    }

    #[tokio::test]
    async fn deleting_a_workflow_drops_its_access_records() {
        let harness = test_state().await;
        let manager = identity("m-1", UserRole::Manager);
        let hire = identity("u-1", UserRole::NewHire);
        call(&harness, "POST", "/api/workflows", &manager, onboarding()).await;
        let outstanding = harness.state.access.issue("wf-1", "u-7@example.com").await.unwrap();
        assert!(harness.state.grants.has_access("wf-1", &hire));

        let (status, _) = call(&harness, "DELETE", "/api/workflows/wf-1", &manager, Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!harness.state.grants.has_access("wf-1", &hire));
        assert!(harness.state.grants.grants_for_workflow("wf-1").is_empty());
        let storage = harness.state.access.storage();
        assert!(storage.load_grants().await.unwrap().is_empty());
        assert!(storage.load_entitlements().await.unwrap().is_empty());

        // Re-creating the id starts from a clean slate
        call(&harness, "POST", "/api/workflows", &manager, onboarding()).await;
        let stale = harness
            .state
            .access
            .redeem("u-7@example.com", &outstanding.code, "u-7", |_| true)
            .await;
        assert!(stale.is_err());
        assert!(!harness.state.grants.has_access("wf-1", &identity("u-7", UserRole::NewHire)));
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found_for_managers() {
        let harness = test_state().await;
        let manager = identity("m-1", UserRole::Manager);
        let (status, body) = call(&harness, "GET", "/api/workflows/nope", &manager, Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "workflow_not_found");

        let (status, _) = call(&harness, "DELETE", "/api/workflows/nope", &manager, Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
