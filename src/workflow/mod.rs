/// Workflow Management Layer
///
/// Handles workflow definitions, persistence and the step progression engine:
/// - Type definitions (Workflow, WorkflowStep, StepContent)
/// - SQLite persistence with sqlx
/// - Registry with a writer lock per workflow instance
/// - Ordered, gated step transitions

// Core workflow type definitions
pub mod types;

// SQLite persistence layer for workflow storage
pub mod storage;

// Lock-free index of per-workflow writer handles
pub mod registry;

// Step locking and transition rules
pub mod progression;

// Re-export commonly used types
pub use progression::{is_unlocked, StepProgressionEngine, TransitionOutcome};
pub use registry::WorkflowRegistry;
pub use storage::WorkflowStorage;
pub use types::{StepStatus, Workflow, WorkflowStep};
