/// Notification dispatcher
///
/// Routes events to the live channels of their target identity (or of every
/// registered identity for broadcasts). Delivery is fire-and-forget: each send is
/// a non-blocking enqueue on the channel's bounded queue, a failed send is logged
/// and counted, and siblings are still served. Per-channel order is the order of
/// `dispatch` calls because each channel has a single FIFO queue.

use crate::realtime::{
    events::{NotificationEvent, Target, WorkflowAction},
    registry::{ChannelHandle, ConnectionRegistry},
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// Outcome of a single dispatch call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Constructed once per process and shared by the gateway, engine pump and monitor
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deliver an event to every resolved channel, never failing
    pub fn dispatch(&self, event: &NotificationEvent) -> DispatchReport {
        let channels: Vec<ChannelHandle> = match &event.target {
            Target::Identity(identity) => {
                if self.registry.is_empty(identity) {
                    tracing::debug!(identity = %identity, event = %event.event_type, "No live channels, skipping");
                    return DispatchReport::default();
                }
                self.registry.channels_for(identity)
            }
            Target::All => self
                .registry
                .identities()
                .iter()
                .flat_map(|identity| self.registry.channels_for(identity))
                .collect(),
        };

        let message = event.to_message();
        let mut report = DispatchReport::default();
        for channel in channels {
            match channel.try_deliver(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    tracing::warn!(event = %event.event_type, "⚠️ {}", failure);
                    report.failed += 1;
                    // Receiver gone without a deregister: prune the stale entry
                    if channel.is_closed() {
                        self.registry.deregister(channel.id);
                    }
                }
            }
        }

        tracing::debug!(
            event = %event.event_type,
            delivered = report.delivered,
            failed = report.failed,
            "📨 Event dispatched"
        );
        report
    }

    pub fn notify_workflow_update(
        &self,
        workspace_id: Option<&str>,
        workflow_id: &str,
        action: WorkflowAction,
    ) -> DispatchReport {
        self.dispatch(&NotificationEvent::workflow_update(workspace_id, workflow_id, action))
    }

    pub fn notify_step_completed(&self, identity: &str, workflow_id: &str, step_id: &str) -> DispatchReport {
        self.dispatch(&NotificationEvent::step_completed(identity, workflow_id, step_id))
    }

    pub fn notify_new_assignment(&self, identity: &str, workflow_id: &str) -> DispatchReport {
        self.dispatch(&NotificationEvent::new_assignment(identity, workflow_id))
    }

    pub fn notify_deadline_approaching(
        &self,
        identity: &str,
        workflow_id: &str,
        step_id: &str,
        days_left: u32,
    ) -> DispatchReport {
        self.dispatch(&NotificationEvent::deadline_approaching(identity, workflow_id, step_id, days_left))
    }

    pub fn notify_error(&self, identity: &str, message: impl Into<String>) -> DispatchReport {
        self.dispatch(&NotificationEvent::error(identity, message))
    }

    /// Drain queued events into `dispatch` until the queue closes or shutdown is signalled
    ///
    /// The receiver sits behind a mutex so a restarted pump resumes the same queue.
    pub async fn run_event_pump(
        &self,
        events: Arc<Mutex<mpsc::UnboundedReceiver<NotificationEvent>>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut events = events.lock().await;
        tracing::info!("📬 Notification pump started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                next = events.recv() => match next {
                    Some(event) => {
                        self.dispatch(&event);
                    }
                    None => {
                        tracing::info!("📭 Event queue closed, notification pump exiting");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("🛑 Notification pump stopped");
        Ok(())
    }
}
