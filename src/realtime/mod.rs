/// Real-time notification layer
///
/// - Event types and wire frames
/// - Connection registry keyed by identity
/// - Fire-and-forget dispatcher and its event pump
/// - Deadline monitor and task supervision

// Notification events and wire messages
pub mod events;

// Identity → live channels
pub mod registry;

// Event routing to channels
pub mod dispatcher;

// Cron-driven DEADLINE_APPROACHING sweep
pub mod deadlines;

// Restart-with-backoff for background tasks
pub mod supervisor;

pub use dispatcher::{DispatchReport, NotificationDispatcher};
pub use events::{EventType, NotificationEvent, OutboundMessage, Target, WorkflowAction};
pub use registry::{ChannelHandle, ConnectionRegistry};
