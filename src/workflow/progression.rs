/// Step progression engine
///
/// Enforces ordered, gated completion of workflow steps. The lock predicate is
/// derived from sibling statuses on every call; nothing about locking is stored.
/// Mutations run under the owning workflow's writer lock, are persisted before
/// they become visible, and emit notification events only after they succeed.

use crate::{
    error::{ProgressionError, StepError},
    realtime::events::{NotificationEvent, WorkflowAction},
    workflow::{
        registry::WorkflowRegistry,
        types::{Progress, StepStatus, Workflow},
    },
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// True iff `index == 0` or every step before `index` is completed
pub fn is_unlocked(workflow: &Workflow, index: usize) -> bool {
    workflow
        .steps
        .iter()
        .take(index)
        .all(|step| step.status == StepStatus::Completed)
}

/// Result of a status change request
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub step_id: String,
    pub from: StepStatus,
    pub to: StepStatus,
    /// False when the step already had the requested status
    pub changed: bool,
    /// Events to dispatch once the change is durable
    pub events: Vec<NotificationEvent>,
}

/// Apply a status transition to an in-memory workflow
///
/// Fails with `LockedStep` when a preceding step is incomplete and with
/// `InvalidTransition` on regressions or unmet completion gates. On failure the
/// workflow is left untouched.
pub fn transition_step(
    workflow: &mut Workflow,
    step_id: &str,
    new_status: StepStatus,
) -> Result<TransitionOutcome, StepError> {
    let index = locate_unlocked(workflow, step_id)?;
    let step = &workflow.steps[index];
    let from = step.status;

    if from == new_status {
        return Ok(TransitionOutcome {
            step_id: step_id.to_string(),
            from,
            to: new_status,
            changed: false,
            events: Vec::new(),
        });
    }

    let invalid = |reason: String| StepError::InvalidTransition {
        step_id: step_id.to_string(),
        from: from.to_string(),
        to: new_status.to_string(),
        reason,
    };

    // Monotonic: pending → in-progress → completed
    if new_status < from {
        return Err(invalid(if from == StepStatus::Completed {
            "completed steps are final".to_string()
        } else {
            "steps cannot move backwards".to_string()
        }));
    }

    if new_status == StepStatus::Completed {
        let open_todos = step.open_required_todos();
        if open_todos > 0 {
            return Err(invalid(format!("{} required checklist item(s) not done", open_todos)));
        }

        if let Some(quiz) = &step.content.quiz {
            if !quiz.is_fully_answered() {
                return Err(invalid(format!(
                    "quiz has {} of {} question(s) answered",
                    quiz.answers.len(),
                    quiz.questions.len()
                )));
            }
            if let Some(required) = workflow.rules.required_quiz_score {
                let score = quiz.score();
                if score < required {
                    return Err(invalid(format!(
                        "quiz score {}% is below the required {}%",
                        score, required
                    )));
                }
            }
        }
    }

    let step = &mut workflow.steps[index];
    step.status = new_status;

    let mut events = vec![NotificationEvent::workflow_update(
        None,
        &workflow.id,
        WorkflowAction::StepUpdated,
    )];
    if new_status == StepStatus::Completed {
        events.extend(
            step.assignees
                .iter()
                .map(|identity| NotificationEvent::step_completed(identity, &workflow.id, step_id)),
        );
    }

    Ok(TransitionOutcome {
        step_id: step_id.to_string(),
        from,
        to: new_status,
        changed: true,
        events,
    })
}

/// Mark a checklist item done or not done on an open step
pub fn set_todo(workflow: &mut Workflow, step_id: &str, todo_index: usize, completed: bool) -> Result<(), StepError> {
    let index = locate_open(workflow, step_id)?;
    let todo = workflow.steps[index]
        .content
        .todos
        .get_mut(todo_index)
        .ok_or_else(|| StepError::SubItemNotFound {
            step_id: step_id.to_string(),
            kind: "todo",
            index: todo_index,
        })?;
    todo.completed = completed;
    Ok(())
}

/// Record an answer to one quiz question on an open step; returns the current score
pub fn record_quiz_answer(
    workflow: &mut Workflow,
    step_id: &str,
    question_index: usize,
    answer: &str,
) -> Result<u8, StepError> {
    let index = locate_open(workflow, step_id)?;
    let missing = || StepError::SubItemNotFound {
        step_id: step_id.to_string(),
        kind: "quiz question",
        index: question_index,
    };

    let quiz = workflow.steps[index].content.quiz.as_mut().ok_or_else(missing)?;
    if question_index >= quiz.questions.len() {
        return Err(missing());
    }
    quiz.answers.insert(question_index, answer.to_string());
    Ok(quiz.score())
}

/// Add an identity to a step's assignee set; yields a NEW_ASSIGNMENT event when it is new
pub fn assign(workflow: &mut Workflow, step_id: &str, identity: &str) -> Result<Option<NotificationEvent>, StepError> {
    let index = locate(workflow, step_id)?;
    if workflow.steps[index].assignees.insert(identity.to_string()) {
        Ok(Some(NotificationEvent::new_assignment(identity, &workflow.id)))
    } else {
        Ok(None)
    }
}

pub fn progress(workflow: &Workflow) -> Progress {
    let total = workflow.steps.len();
    let completed = workflow
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    let percent = if total == 0 {
        0
    } else {
        ((completed as f64 * 100.0) / total as f64).round() as u8
    };
    Progress { completed, total, percent }
}

fn locate(workflow: &Workflow, step_id: &str) -> Result<usize, StepError> {
    workflow.step_index(step_id).ok_or_else(|| StepError::StepNotFound {
        workflow_id: workflow.id.clone(),
        step_id: step_id.to_string(),
    })
}

fn locate_unlocked(workflow: &Workflow, step_id: &str) -> Result<usize, StepError> {
    let index = locate(workflow, step_id)?;
    if !is_unlocked(workflow, index) {
        return Err(StepError::LockedStep {
            workflow_id: workflow.id.clone(),
            step_id: step_id.to_string(),
            index,
        });
    }
    Ok(index)
}

/// Unlocked and not yet completed
fn locate_open(workflow: &Workflow, step_id: &str) -> Result<usize, StepError> {
    let index = locate_unlocked(workflow, step_id)?;
    let status = workflow.steps[index].status;
    if status == StepStatus::Completed {
        return Err(StepError::InvalidTransition {
            step_id: step_id.to_string(),
            from: status.to_string(),
            to: status.to_string(),
            reason: "completed steps cannot be edited".to_string(),
        });
    }
    Ok(index)
}

/// Persisted step progression service
///
/// Serializes writers per workflow through the registry's per-workflow lock and
/// forwards emitted events to the notification pump without waiting on delivery.
#[derive(Debug, Clone)]
pub struct StepProgressionEngine {
    registry: Arc<WorkflowRegistry>,
    events: mpsc::UnboundedSender<NotificationEvent>,
}

impl StepProgressionEngine {
    pub fn new(registry: Arc<WorkflowRegistry>, events: mpsc::UnboundedSender<NotificationEvent>) -> Self {
        Self { registry, events }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Transition a step and persist the result
    pub async fn transition(
        &self,
        workflow_id: &str,
        step_id: &str,
        new_status: StepStatus,
    ) -> Result<TransitionOutcome, ProgressionError> {
        let outcome = self
            .mutate(workflow_id, |draft| transition_step(draft, step_id, new_status))
            .await?;

        if outcome.changed {
            tracing::info!(
                workflow_id,
                step_id,
                from = %outcome.from,
                to = %outcome.to,
                "🔁 Step transitioned"
            );
            self.emit(outcome.events.iter().cloned());
        }
        Ok(outcome)
    }

    pub async fn set_todo(
        &self,
        workflow_id: &str,
        step_id: &str,
        todo_index: usize,
        completed: bool,
    ) -> Result<(), ProgressionError> {
        self.mutate(workflow_id, |draft| set_todo(draft, step_id, todo_index, completed))
            .await?;
        tracing::debug!(workflow_id, step_id, todo_index, completed, "☑️ Checklist item updated");
        Ok(())
    }

    pub async fn record_quiz_answer(
        &self,
        workflow_id: &str,
        step_id: &str,
        question_index: usize,
        answer: &str,
    ) -> Result<u8, ProgressionError> {
        let score = self
            .mutate(workflow_id, |draft| record_quiz_answer(draft, step_id, question_index, answer))
            .await?;
        tracing::debug!(workflow_id, step_id, question_index, score, "📝 Quiz answer recorded");
        Ok(score)
    }

    pub async fn assign(&self, workflow_id: &str, step_id: &str, identity: &str) -> Result<bool, ProgressionError> {
        let event = self
            .mutate(workflow_id, |draft| assign(draft, step_id, identity))
            .await?;
        let added = event.is_some();
        if added {
            tracing::info!(workflow_id, step_id, identity, "👤 Step assigned");
        }
        self.emit(event);
        Ok(added)
    }

    pub async fn progress(&self, workflow_id: &str) -> Result<Progress, StepError> {
        let workflow = self
            .registry
            .snapshot(workflow_id)
            .await
            .ok_or_else(|| StepError::WorkflowNotFound(workflow_id.to_string()))?;
        Ok(progress(&workflow))
    }

    /// Run `op` against a copy of the workflow under its writer lock, persist the
    /// copy, then publish it. Failures leave both memory and storage untouched.
    async fn mutate<T, F>(&self, workflow_id: &str, op: F) -> Result<T, ProgressionError>
    where
        F: FnOnce(&mut Workflow) -> Result<T, StepError>,
    {
        let handle = self
            .registry
            .handle(workflow_id)
            .ok_or_else(|| StepError::WorkflowNotFound(workflow_id.to_string()))?;

        let mut guard = handle.lock().await;
        // Removed while we waited for the lock
        if !self.registry.is_current(workflow_id, &handle) {
            return Err(StepError::WorkflowNotFound(workflow_id.to_string()).into());
        }
        let mut draft = guard.clone();
        let result = op(&mut draft)?;

        self.registry.storage().save_workflow(&draft).await?;
        *guard = draft;
        Ok(result)
    }

    fn emit(&self, events: impl IntoIterator<Item = NotificationEvent>) {
        for event in events {
            if self.events.send(event).is_err() {
                tracing::debug!("📭 Notification pump is gone, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::events::{EventType, Target};
    use crate::workflow::{
        storage::WorkflowStorage,
        types::{Quiz, QuizQuestion, TodoItem, WorkflowStep},
    };

    fn three_step_workflow() -> Workflow {
        let mut wf = Workflow::new("wf-1", "New hire");
        for (id, title) in [("a", "Welcome"), ("b", "Paperwork"), ("c", "Training")] {
            let mut step = WorkflowStep::new(id, title, 0, 3);
            step.assignees.insert("u-1".to_string());
            wf.push_step(step);
        }
        wf
    }

    fn quiz_with(required_score: Option<u8>) -> Workflow {
        let mut wf = three_step_workflow();
        wf.rules.required_quiz_score = required_score;
        wf.steps[0].content.quiz = Some(Quiz {
            questions: vec![
                QuizQuestion {
                    question: "Q1".into(),
                    options: vec!["x".into(), "y".into()],
                    correct_answer: "x".into(),
                },
                QuizQuestion {
                    question: "Q2".into(),
                    options: vec!["x".into(), "y".into()],
                    correct_answer: "y".into(),
                },
            ],
            answers: Default::default(),
        });
        wf
    }

    #[test]
    fn first_step_is_always_unlocked() {
        let wf = three_step_workflow();
        assert!(is_unlocked(&wf, 0));
        assert!(!is_unlocked(&wf, 1));
        assert!(!is_unlocked(&wf, 2));
    }

    #[test]
    fn unlocking_follows_completed_prefix() {
        let mut wf = three_step_workflow();
        wf.steps[0].status = StepStatus::Completed;
        wf.steps[1].status = StepStatus::InProgress;
        assert!(is_unlocked(&wf, 1));
        assert!(!is_unlocked(&wf, 2));

        wf.steps[1].status = StepStatus::Completed;
        assert!(is_unlocked(&wf, 2));
    }

    #[test]
    fn ordered_completion_scenario() {
        let mut wf = three_step_workflow();

        let err = transition_step(&mut wf, "b", StepStatus::Completed).unwrap_err();
        assert!(matches!(err, StepError::LockedStep { index: 1, .. }));
        assert_eq!(wf.steps[1].status, StepStatus::Pending);

        transition_step(&mut wf, "a", StepStatus::Completed).unwrap();
        assert_eq!(wf.steps[0].status, StepStatus::Completed);
        transition_step(&mut wf, "b", StepStatus::Completed).unwrap();
        transition_step(&mut wf, "c", StepStatus::Completed).unwrap();

        let err = transition_step(&mut wf, "a", StepStatus::InProgress).unwrap_err();
        assert!(matches!(err, StepError::InvalidTransition { .. }));
        assert_eq!(wf.steps[0].status, StepStatus::Completed);
    }

    #[test]
    fn locked_step_fails_regardless_of_content() {
        let mut wf = three_step_workflow();
        wf.steps[0].status = StepStatus::InProgress;
        // c has nothing gating it, but b is still open
        wf.steps[1].status = StepStatus::Pending;
        let err = transition_step(&mut wf, "c", StepStatus::Completed).unwrap_err();
        assert!(matches!(err, StepError::LockedStep { .. }));
    }

    #[test]
    fn in_progress_cannot_go_back_to_pending() {
        let mut wf = three_step_workflow();
        transition_step(&mut wf, "a", StepStatus::InProgress).unwrap();
        let err = transition_step(&mut wf, "a", StepStatus::Pending).unwrap_err();
        assert!(matches!(err, StepError::InvalidTransition { .. }));
    }

    #[test]
    fn same_status_is_a_silent_no_op() {
        let mut wf = three_step_workflow();
        transition_step(&mut wf, "a", StepStatus::Completed).unwrap();
        let outcome = transition_step(&mut wf, "a", StepStatus::Completed).unwrap();
        assert!(!outcome.changed);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn required_todos_gate_completion() {
        let mut wf = three_step_workflow();
        wf.steps[0].content.todos = vec![
            TodoItem { text: "Sign NDA".into(), required: true, completed: false },
            TodoItem { text: "Say hi".into(), required: false, completed: false },
        ];

        let err = transition_step(&mut wf, "a", StepStatus::Completed).unwrap_err();
        assert!(matches!(err, StepError::InvalidTransition { .. }));

        set_todo(&mut wf, "a", 0, true).unwrap();
        transition_step(&mut wf, "a", StepStatus::Completed).unwrap();
        assert_eq!(wf.steps[0].status, StepStatus::Completed);
    }

    #[test]
    fn quiz_must_be_fully_answered() {
        let mut wf = quiz_with(None);
        record_quiz_answer(&mut wf, "a", 0, "y").unwrap();
        assert!(transition_step(&mut wf, "a", StepStatus::Completed).is_err());

        // Wrong answers are advisory without a required score
        let score = record_quiz_answer(&mut wf, "a", 1, "x").unwrap();
        assert_eq!(score, 0);
        transition_step(&mut wf, "a", StepStatus::Completed).unwrap();
    }

    #[test]
    fn required_quiz_score_is_enforced() {
        let mut wf = quiz_with(Some(100));
        record_quiz_answer(&mut wf, "a", 0, "x").unwrap();
        record_quiz_answer(&mut wf, "a", 1, "x").unwrap();
        let err = transition_step(&mut wf, "a", StepStatus::Completed).unwrap_err();
        assert!(err.to_string().contains("50%"));

        record_quiz_answer(&mut wf, "a", 1, "y").unwrap();
        transition_step(&mut wf, "a", StepStatus::Completed).unwrap();
    }

    #[test]
    fn quiz_index_out_of_range_is_rejected() {
        let mut wf = quiz_with(None);
        let err = record_quiz_answer(&mut wf, "a", 5, "x").unwrap_err();
        assert!(matches!(err, StepError::SubItemNotFound { index: 5, .. }));
    }

    #[test]
    fn completed_steps_reject_sub_item_edits() {
        let mut wf = three_step_workflow();
        wf.steps[0].content.todos = vec![TodoItem { text: "Read".into(), required: false, completed: false }];
        transition_step(&mut wf, "a", StepStatus::Completed).unwrap();
        assert!(set_todo(&mut wf, "a", 0, true).is_err());
    }

    #[test]
    fn completion_notifies_every_assignee() {
        let mut wf = three_step_workflow();
        wf.steps[0].assignees.insert("u-2".to_string());
        let outcome = transition_step(&mut wf, "a", StepStatus::Completed).unwrap();

        let targets: Vec<_> = outcome
            .events
            .iter()
            .filter(|e| e.event_type == EventType::StepCompleted)
            .map(|e| e.target.clone())
            .collect();
        assert_eq!(
            targets,
            vec![Target::Identity("u-1".into()), Target::Identity("u-2".into())]
        );
        assert!(outcome.events.iter().any(|e| e.event_type == EventType::WorkflowUpdate));
    }

    #[test]
    fn progress_reports_percentages() {
        let mut wf = three_step_workflow();
        transition_step(&mut wf, "a", StepStatus::Completed).unwrap();
        assert_eq!(progress(&wf), Progress { completed: 1, total: 3, percent: 33 });
    }

    async fn engine() -> (StepProgressionEngine, mpsc::UnboundedReceiver<NotificationEvent>) {
        let storage = WorkflowStorage::in_memory().await.unwrap();
        let registry = Arc::new(WorkflowRegistry::new(storage));
        registry.upsert(three_step_workflow()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (StepProgressionEngine::new(registry, tx), rx)
    }

    #[tokio::test]
    async fn engine_persists_and_emits_on_success() {
        let (engine, mut rx) = engine().await;
        engine.transition("wf-1", "a", StepStatus::Completed).await.unwrap();

        let stored = engine.registry().storage().get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(stored.steps[0].status, StepStatus::Completed);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::WorkflowUpdate);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::StepCompleted);
        assert_eq!(second.target, Target::Identity("u-1".into()));
    }

    #[tokio::test]
    async fn engine_failure_leaves_no_trace() {
        let (engine, mut rx) = engine().await;
        let err = engine.transition("wf-1", "c", StepStatus::Completed).await.unwrap_err();
        assert!(matches!(err, ProgressionError::Step(StepError::LockedStep { .. })));

        let snapshot = engine.registry().snapshot("wf-1").await.unwrap();
        assert!(snapshot.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_completions_respect_ordering() {
        let (engine, _rx) = engine().await;
        let mut handles = Vec::new();
        for step in ["c", "b", "a"] {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.transition("wf-1", step, StepStatus::Completed).await
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }

        let wf = engine.registry().snapshot("wf-1").await.unwrap();
        // Whatever interleaving happened, completed steps form a prefix
        let statuses: Vec<_> = wf.steps.iter().map(|s| s.status).collect();
        let first_open = statuses.iter().position(|s| *s != StepStatus::Completed).unwrap_or(statuses.len());
        assert!(statuses[first_open..].iter().all(|s| *s != StepStatus::Completed));
        assert_eq!(statuses[0], StepStatus::Completed);
    }

    #[tokio::test]
    async fn assigning_twice_notifies_once() {
        let (engine, mut rx) = engine().await;
        assert!(engine.assign("wf-1", "b", "u-9").await.unwrap());
        assert!(!engine.assign("wf-1", "b", "u-9").await.unwrap());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::NewAssignment);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_workflow_is_reported() {
        let (engine, _rx) = engine().await;
        let err = engine.transition("wf-404", "a", StepStatus::Completed).await.unwrap_err();
        assert!(matches!(err, ProgressionError::Step(StepError::WorkflowNotFound(_))));
    }
}
