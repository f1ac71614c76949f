/// Fixtures shared by unit tests

use crate::{
    access::{
        ledger::AccessLedger,
        storage::GrantStorage,
        store::AccessGrantStore,
        types::{Identity, UserRole},
    },
    api::state::AppState,
    gateway::auth::JwtVerifier,
    realtime::{
        dispatcher::NotificationDispatcher, events::NotificationEvent, registry::ConnectionRegistry,
    },
    workflow::{progression::StepProgressionEngine, registry::WorkflowRegistry, storage::WorkflowStorage},
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub(crate) const TEST_SECRET: &str = "test-secret";

pub(crate) struct Harness {
    pub state: AppState,
    /// Engine events not yet pumped to the dispatcher
    pub events: mpsc::UnboundedReceiver<NotificationEvent>,
    /// Held so the shutdown signal stays open for the test's lifetime
    _stop: watch::Sender<bool>,
}

impl Harness {
    /// Dispatch every queued engine event, as the pump would
    pub fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.try_recv() {
            self.state.dispatcher.dispatch(&event);
            count += 1;
        }
        count
    }
}

/// Fully wired state over a private in-memory database
pub(crate) async fn test_state() -> Harness {
    let storage = WorkflowStorage::in_memory().await.unwrap();
    let grant_storage = GrantStorage::new(storage.pool().clone());
    grant_storage.init_schema().await.unwrap();

    let registry = Arc::new(WorkflowRegistry::new(storage));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(ConnectionRegistry::new());
    let (stop, shutdown) = watch::channel(false);
    let grants = Arc::new(AccessGrantStore::default());

    let state = AppState {
        engine: StepProgressionEngine::new(Arc::clone(&registry), events_tx),
        registry,
        access: Arc::new(AccessLedger::new(Arc::clone(&grants), grant_storage)),
        grants,
        dispatcher: NotificationDispatcher::new(Arc::clone(&connections)),
        connections,
        verifier: Arc::new(JwtVerifier::from_secret(TEST_SECRET)),
        channel_buffer: 16,
        shutdown,
    };
    Harness {
        state,
        events: events_rx,
        _stop: stop,
    }
}

pub(crate) fn identity(user_id: &str, role: UserRole) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        email: Some(format!("{}@example.com", user_id)),
        role,
    }
}

/// Signed bearer token for `identity`
pub(crate) fn token_for(identity: &Identity) -> String {
    JwtVerifier::from_secret(TEST_SECRET)
        .issue(identity, chrono::Duration::minutes(10))
        .unwrap()
}
