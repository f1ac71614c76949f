/// Deadline monitor
///
/// Periodically sweeps active workflows with tokio-cron-scheduler and announces
/// DEADLINE_APPROACHING to the assignees of every unfinished step that falls due
/// inside the notice window. Each (workflow, step, days_left) is announced once.

use crate::{
    realtime::events::NotificationEvent,
    workflow::{
        registry::WorkflowRegistry,
        types::{StepStatus, Workflow, WorkflowStatus},
    },
};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::{collections::HashSet, sync::Arc};
use tokio::sync::{mpsc, watch};
use tokio_cron_scheduler::{Job, JobScheduler};

const SECONDS_PER_DAY: i64 = 86_400;

/// An unfinished step due within the notice window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueStep {
    pub step_id: String,
    pub days_left: u32,
    pub assignees: Vec<String>,
}

/// Unfinished steps of an active, started workflow that are due within
/// `window_days` of `now` but not yet overdue
pub fn due_soon(workflow: &Workflow, now: DateTime<Utc>, window_days: u32) -> Vec<DueStep> {
    if workflow.status != WorkflowStatus::Active {
        return Vec::new();
    }
    let window = Duration::days(i64::from(window_days));

    workflow
        .steps
        .iter()
        .filter(|step| step.status != StepStatus::Completed)
        .filter_map(|step| {
            let remaining = step.due_at(workflow.started_at)? - now;
            if remaining <= Duration::zero() || remaining > window {
                return None;
            }
            let secs = remaining.num_seconds();
            // Ceiling of whole days left
            let days_left = ((secs + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY).max(1) as u32;
            Some(DueStep {
                step_id: step.id.clone(),
                days_left,
                assignees: step.assignees.iter().cloned().collect(),
            })
        })
        .collect()
}

pub struct DeadlineMonitor {
    registry: Arc<WorkflowRegistry>,
    events: mpsc::UnboundedSender<NotificationEvent>,
    window_days: u32,
    /// Key: (workflow_id, step_id), Value: last announced days_left
    announced: DashMap<(String, String), u32>,
}

impl DeadlineMonitor {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        events: mpsc::UnboundedSender<NotificationEvent>,
        window_days: u32,
    ) -> Self {
        Self {
            registry,
            events,
            window_days,
            announced: DashMap::new(),
        }
    }

    /// Run one sweep at `now`, returning the number of events emitted
    ///
    /// Countdowns of steps that are no longer due (completed, overdue, deleted)
    /// are forgotten.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut emitted = 0;
        let mut still_due = HashSet::new();

        for workflow in self.registry.snapshot_all().await {
            for due in due_soon(&workflow, now, self.window_days) {
                let key = (workflow.id.clone(), due.step_id.clone());
                still_due.insert(key.clone());
                if self.announced.get(&key).map(|d| *d == due.days_left).unwrap_or(false) {
                    continue;
                }
                self.announced.insert(key, due.days_left);

                tracing::info!(
                    workflow_id = %workflow.id,
                    step_id = %due.step_id,
                    days_left = due.days_left,
                    assignees = due.assignees.len(),
                    "⏰ Step deadline approaching"
                );
                for identity in &due.assignees {
                    let event =
                        NotificationEvent::deadline_approaching(identity, &workflow.id, &due.step_id, due.days_left);
                    if self.events.send(event).is_err() {
                        tracing::debug!("📭 Notification pump is gone, dropping deadline event");
                    } else {
                        emitted += 1;
                    }
                }
            }
        }

        self.announced.retain(|key, _| still_due.contains(key));
        emitted
    }

    /// Number of countdowns currently remembered
    pub fn tracked(&self) -> usize {
        self.announced.len()
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    /// Start the cron sweep, hold it until shutdown, then stop the scheduler
    pub async fn run(self: Arc<Self>, schedule: String, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut scheduler = JobScheduler::new().await?;

        let monitor = Arc::clone(&self);
        let job = Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let monitor = Arc::clone(&monitor);
            Box::pin(async move {
                let emitted = monitor.sweep().await;
                tracing::debug!(emitted, tracked = monitor.tracked(), "🔔 Deadline sweep finished");
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;
        tracing::info!(schedule = %schedule, window_days = self.window_days, "⏰ Deadline monitor started");

        // A dropped sender also ends the wait
        let _ = shutdown.wait_for(|stop| *stop).await;

        scheduler.shutdown().await?;
        tracing::info!("⏹️ Deadline monitor stopped");
        Ok(())
    }
}
