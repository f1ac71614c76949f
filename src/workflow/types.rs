/// Core workflow type definitions
///
/// Defines workflows, their ordered steps and the opaque step content the
/// progression engine inspects for completion gates (checklists and quizzes).
/// These types are serialized to JSON for persistence and for the REST surface.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// An onboarding workflow: an ordered collection of steps assigned to identities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-new-hire")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Steps in position order
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Per-workflow completion rules
    #[serde(default)]
    pub rules: WorkflowRules,
    pub created_at: DateTime<Utc>,
    /// When the workflow was handed to its assignees; step deadlines count from here
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// High-water mark of handed-out step positions
    #[serde(default)]
    pub position_counter: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Archived => "archived",
        }
    }
}

/// Per-workflow completion rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRules {
    /// Minimum quiz score (0..=100) a step's quiz must reach before the step completes.
    /// `None` keeps grading advisory.
    #[serde(default)]
    pub required_quiz_score: Option<u8>,
}

/// A single unit of work within a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Stable ordinal position, assigned at creation and never reused
    pub position: u32,
    #[serde(default)]
    pub status: StepStatus,
    /// Days after the workflow start by which the step is due
    pub due_in_days: u32,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    #[serde(default)]
    pub content: StepContent,
}

/// Step lifecycle: pending → in-progress → completed (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in-progress",
            StepStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form step payload; only `todos` and `quiz` matter to the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz: Option<Quiz>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub todos: Vec<TodoItem>,
}

/// Checklist entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub completed: bool,
}

/// Quiz attached to a step, with the answers recorded so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    pub questions: Vec<QuizQuestion>,
    /// Recorded answers keyed by question index
    #[serde(default)]
    pub answers: HashMap<usize, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_answer: String,
}

impl Quiz {
    /// True once every question has a recorded answer
    pub fn is_fully_answered(&self) -> bool {
        (0..self.questions.len()).all(|idx| self.answers.contains_key(&idx))
    }

    /// Score in percent, graded by exact match against the stored correct answers.
    /// A quiz without questions scores 100.
    pub fn score(&self) -> u8 {
        if self.questions.is_empty() {
            return 100;
        }

        let correct = self
            .questions
            .iter()
            .enumerate()
            .filter(|(idx, q)| self.answers.get(idx) == Some(&q.correct_answer))
            .count();

        ((correct as f64 * 100.0) / self.questions.len() as f64).round() as u8
    }
}

impl WorkflowStep {
    /// Create a pending step with no assignees and empty content
    pub fn new(id: impl Into<String>, title: impl Into<String>, position: u32, due_in_days: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            position,
            status: StepStatus::Pending,
            due_in_days,
            assignees: BTreeSet::new(),
            content: StepContent::default(),
        }
    }

    /// Required checklist items that are still open
    pub fn open_required_todos(&self) -> usize {
        self.content
            .todos
            .iter()
            .filter(|todo| todo.required && !todo.completed)
            .count()
    }

    /// Due date relative to the workflow start, if the workflow has started
    pub fn due_at(&self, started_at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        started_at.map(|start| start + Duration::days(i64::from(self.due_in_days)))
    }
}

impl Workflow {
    /// Create an empty draft workflow
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            status: WorkflowStatus::Draft,
            steps: Vec::new(),
            rules: WorkflowRules::default(),
            created_at: Utc::now(),
            started_at: None,
            position_counter: 0,
        }
    }

    /// Append a step, assigning the next unused position
    pub fn push_step(&mut self, mut step: WorkflowStep) -> u32 {
        let position = self.next_position();
        step.position = position;
        self.position_counter = position + 1;
        self.steps.push(step);
        position
    }

    /// Next position; positions of removed steps are never handed out again
    pub fn next_position(&self) -> u32 {
        let highest = self.steps.iter().map(|s| s.position + 1).max().unwrap_or(0);
        highest.max(self.position_counter)
    }

    /// Sort steps by their stable position
    pub fn normalize_order(&mut self) {
        self.steps.sort_by_key(|s| s.position);
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// All identities assigned to any step
    pub fn participants(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .flat_map(|s| s.assignees.iter().cloned())
            .collect()
    }
}

/// Completion summary used by progress bars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: u8,
}
