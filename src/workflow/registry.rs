/// In-memory workflow registry with a writer lock per workflow instance
///
/// The id → workflow index is swapped atomically with ArcSwap so lookups never
/// block. Each workflow lives behind its own async mutex, which is the single
/// writer slot for that instance: mutations of one workflow are serialized while
/// different workflows proceed in parallel.

use crate::workflow::{storage::WorkflowStorage, types::Workflow};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// Shared handle to one workflow instance
pub type WorkflowHandle = Arc<Mutex<Workflow>>;

#[derive(Debug)]
pub struct WorkflowRegistry {
    /// Key: workflow_id, Value: writer-locked workflow
    workflows: ArcSwap<HashMap<String, WorkflowHandle>>,

    /// Persistence collaborator
    storage: WorkflowStorage,
}

impl WorkflowRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    pub fn storage(&self) -> &WorkflowStorage {
        &self.storage
    }

    /// Populate the registry from storage at startup
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_workflows().await?;
        let handles: HashMap<String, WorkflowHandle> = stored
            .into_iter()
            .map(|(id, mut workflow)| {
                workflow.normalize_order();
                (id, Arc::new(Mutex::new(workflow)))
            })
            .collect();

        self.workflows.store(Arc::new(handles));

        tracing::info!("Initialized workflow registry with {} workflows",
            self.workflows.load().len());

        Ok(())
    }

    /// Persist a workflow and make it visible, replacing any previous definition
    ///
    /// An existing definition is replaced under its writer lock, so the saved row
    /// and the in-memory copy never disagree with a concurrent engine write.
    pub async fn upsert(&self, mut workflow: Workflow) -> Result<()> {
        workflow.normalize_order();

        if let Some(handle) = self.handle(&workflow.id) {
            return self.replace(&handle, workflow).await;
        }

        self.storage.save_workflow(&workflow).await?;
        let id = workflow.id.clone();
        let handle = Arc::new(Mutex::new(workflow));
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.entry(id.clone()).or_insert_with(|| Arc::clone(&handle));
            next
        });

        // A concurrent upsert registered the id first: write ours through its lock
        if let Some(winner) = self.handle(&id).filter(|h| !Arc::ptr_eq(h, &handle)) {
            let workflow = handle.lock().await.clone();
            return self.replace(&winner, workflow).await;
        }

        tracing::info!("Registered workflow: {}", id);
        Ok(())
    }

    async fn replace(&self, handle: &WorkflowHandle, workflow: Workflow) -> Result<()> {
        let mut current = handle.lock().await;
        self.storage.save_workflow(&workflow).await?;
        *current = workflow;
        Ok(())
    }

    /// True while `handle` is the registered handle for `workflow_id`
    pub fn is_current(&self, workflow_id: &str, handle: &WorkflowHandle) -> bool {
        self.workflows
            .load()
            .get(workflow_id)
            .map(|registered| Arc::ptr_eq(registered, handle))
            .unwrap_or(false)
    }

    /// Lock-free lookup of a workflow's writer handle
    pub fn handle(&self, workflow_id: &str) -> Option<WorkflowHandle> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// Consistent copy of a workflow, taken under its lock
    pub async fn snapshot(&self, workflow_id: &str) -> Option<Workflow> {
        let handle = self.handle(workflow_id)?;
        let workflow = handle.lock().await;
        Some(workflow.clone())
    }

    /// Copies of every registered workflow
    pub async fn snapshot_all(&self) -> Vec<Workflow> {
        let handles: Vec<WorkflowHandle> = self.workflows.load().values().cloned().collect();
        let mut workflows = Vec::with_capacity(handles.len());
        for handle in handles {
            workflows.push(handle.lock().await.clone());
        }
        workflows
    }

    /// Remove a workflow from memory and storage; returns whether it existed
    ///
    /// Runs under the workflow's writer lock; writers queued behind it find the
    /// handle retired and give up.
    pub async fn remove(&self, workflow_id: &str) -> Result<bool> {
        let handle = self.handle(workflow_id);
        let _guard = match &handle {
            Some(handle) => Some(handle.lock().await),
            None => None,
        };

        let existed = self.storage.delete_workflow(workflow_id).await?;
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(workflow_id);
            next
        });

        if existed {
            tracing::info!("Removed workflow from registry: {}", workflow_id);
        }
        Ok(existed)
    }
}
