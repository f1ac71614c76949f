/// Notification events and the wire shapes exchanged over live channels
///
/// Events are ephemeral: produced, dispatched to whoever is connected, and dropped.
/// Outbound frames are `{ "type": ..., "data": {...} }`; inbound frames use the same
/// envelope and are informational only.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Kinds of events pushed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowUpdate,
    StepCompleted,
    NewAssignment,
    DeadlineApproaching,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowUpdate => "WORKFLOW_UPDATE",
            EventType::StepCompleted => "STEP_COMPLETED",
            EventType::NewAssignment => "NEW_ASSIGNMENT",
            EventType::DeadlineApproaching => "DEADLINE_APPROACHING",
            EventType::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who an event is routed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every channel of one identity
    Identity(String),
    /// Every currently registered identity
    All,
}

/// A routed event with its type-specific payload
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub event_type: EventType,
    pub target: Target,
    pub data: Value,
}

/// What happened to a workflow in a WORKFLOW_UPDATE broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Created,
    Updated,
    Deleted,
    StepUpdated,
}

impl NotificationEvent {
    pub fn workflow_update(workspace_id: Option<&str>, workflow_id: &str, action: WorkflowAction) -> Self {
        Self {
            event_type: EventType::WorkflowUpdate,
            target: Target::All,
            data: json!({
                "workspaceId": workspace_id,
                "workflowId": workflow_id,
                "action": action,
            }),
        }
    }

    pub fn step_completed(identity: &str, workflow_id: &str, step_id: &str) -> Self {
        Self {
            event_type: EventType::StepCompleted,
            target: Target::Identity(identity.to_string()),
            data: json!({ "workflowId": workflow_id, "stepId": step_id }),
        }
    }

    pub fn new_assignment(identity: &str, workflow_id: &str) -> Self {
        Self {
            event_type: EventType::NewAssignment,
            target: Target::Identity(identity.to_string()),
            data: json!({ "workflowId": workflow_id }),
        }
    }

    pub fn deadline_approaching(identity: &str, workflow_id: &str, step_id: &str, days_left: u32) -> Self {
        Self {
            event_type: EventType::DeadlineApproaching,
            target: Target::Identity(identity.to_string()),
            data: json!({
                "workflowId": workflow_id,
                "stepId": step_id,
                "daysLeft": days_left,
            }),
        }
    }

    pub fn error(identity: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Error,
            target: Target::Identity(identity.to_string()),
            data: json!({ "message": message.into() }),
        }
    }

    /// Wire form of the event, without routing information
    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage {
            kind: self.event_type.as_str().to_string(),
            data: self.data.clone(),
        }
    }
}

/// Server → client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl OutboundMessage {
    pub fn pong() -> Self {
        Self {
            kind: "PONG".to_string(),
            data: json!({}),
        }
    }

    pub fn to_json(&self) -> String {
        // Value payloads always serialize
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Client → server frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_completed_serializes_to_wire_shape() {
        let event = NotificationEvent::step_completed("u-1", "wf-1", "s-2");
        let wire: Value = serde_json::from_str(&event.to_message().to_json()).unwrap();
        assert_eq!(
            wire,
            json!({ "type": "STEP_COMPLETED", "data": { "workflowId": "wf-1", "stepId": "s-2" } })
        );
        assert_eq!(event.target, Target::Identity("u-1".into()));
    }

    #[test]
    fn workflow_update_is_a_broadcast() {
        let event = NotificationEvent::workflow_update(None, "wf-1", WorkflowAction::StepUpdated);
        assert_eq!(event.target, Target::All);
        assert_eq!(event.data["action"], "step_updated");
        assert!(event.data["workspaceId"].is_null());
    }

    #[test]
    fn inbound_message_tolerates_missing_data() {
        let msg: InboundMessage = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(msg.kind, "PING");
        assert!(msg.data.is_null());
        assert!(serde_json::from_str::<InboundMessage>("{not json").is_err());
    }
}
