/// Connection registry
///
/// Maps each authenticated identity to its set of live channels, plus a reverse
/// index from channel id to identity so a channel can be dropped without knowing
/// who owned it. Both maps are lock-striped (`DashMap`), so registration and
/// dispatch lookups for different identities never contend.

use crate::{error::DispatchFailure, realtime::events::OutboundMessage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// One live connection: the sending half of its bounded outbound queue
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub id: Uuid,
    pub identity: String,
    pub opened_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundMessage>,
}

impl ChannelHandle {
    /// New handle with an outbound queue of `buffer` messages
    pub fn new(identity: impl Into<String>, buffer: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            opened_at: Utc::now(),
            sender,
        };
        (handle, receiver)
    }

    /// Enqueue without waiting; a full or closed queue is reported, never awaited
    pub fn try_deliver(&self, message: OutboundMessage) -> Result<(), DispatchFailure> {
        self.sender.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => DispatchFailure::ChannelFull {
                identity: self.identity.clone(),
                channel_id: self.id.to_string(),
            },
            TrySendError::Closed(_) => DispatchFailure::ChannelClosed {
                identity: self.identity.clone(),
                channel_id: self.id.to_string(),
            },
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_identity: DashMap<String, HashMap<Uuid, ChannelHandle>>,
    owners: DashMap<Uuid, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel to its identity's set; identities may hold any number of channels
    pub fn register(&self, channel: ChannelHandle) {
        let identity = channel.identity.clone();
        let channel_id = channel.id;

        self.owners.insert(channel_id, identity.clone());
        let count = {
            let mut channels = self.by_identity.entry(identity.clone()).or_default();
            channels.insert(channel_id, channel);
            channels.len()
        };

        tracing::info!(identity = %identity, channel_id = %channel_id, channels = count, "🔌 Channel registered");
    }

    /// Remove a channel from whichever identity holds it. Safe to call twice.
    pub fn deregister(&self, channel_id: Uuid) -> bool {
        let Some((_, identity)) = self.owners.remove(&channel_id) else {
            return false;
        };

        let removed = self
            .by_identity
            .get_mut(&identity)
            .map(|mut channels| channels.remove(&channel_id).is_some())
            .unwrap_or(false);

        // Drop the identity entry once its last channel is gone
        self.by_identity.remove_if(&identity, |_, channels| channels.is_empty());

        if removed {
            tracing::info!(identity = %identity, channel_id = %channel_id, "🔌 Channel deregistered");
        }
        removed
    }

    /// Snapshot of an identity's channels; any of them may close right after
    pub fn channels_for(&self, identity: &str) -> Vec<ChannelHandle> {
        self.by_identity
            .get(identity)
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self, identity: &str) -> bool {
        self.by_identity
            .get(identity)
            .map(|channels| channels.is_empty())
            .unwrap_or(true)
    }

    /// Identities with at least one registered channel
    pub fn identities(&self) -> Vec<String> {
        self.by_identity
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_and_lookup_by_identity() {
        let registry = ConnectionRegistry::new();
        let (tab1, _rx1) = ChannelHandle::new("u-1", 4);
        let (tab2, _rx2) = ChannelHandle::new("u-1", 4);
        let (other, _rx3) = ChannelHandle::new("u-2", 4);
        registry.register(tab1.clone());
        registry.register(tab2);
        registry.register(other);

        assert_eq!(registry.channels_for("u-1").len(), 2);
        assert_eq!(registry.channels_for("u-2").len(), 1);
        assert!(registry.channels_for("nobody").is_empty());
        assert!(registry.is_empty("nobody"));
        assert!(!registry.is_empty("u-1"));
        assert_eq!(registry.connection_count(), 3);

        let mut identities = registry.identities();
        identities.sort();
        assert_eq!(identities, vec!["u-1".to_string(), "u-2".to_string()]);
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tab, _rx) = ChannelHandle::new("u-1", 4);
        let id = tab.id;
        registry.register(tab);

        assert!(registry.deregister(id));
        assert!(!registry.deregister(id));
        assert!(registry.is_empty("u-1"));
        assert!(registry.identities().is_empty());
        assert!(!registry.deregister(Uuid::new_v4()));
    }

    #[test]
    fn try_deliver_reports_full_and_closed_queues() {
        let (handle, rx) = ChannelHandle::new("u-1", 1);
        handle.try_deliver(OutboundMessage::pong()).unwrap();
        assert!(matches!(
            handle.try_deliver(OutboundMessage::pong()),
            Err(DispatchFailure::ChannelFull { .. })
        ));

        drop(rx);
        assert!(handle.is_closed());
        assert!(matches!(
            handle.try_deliver(OutboundMessage::pong()),
            Err(DispatchFailure::ChannelClosed { .. })
        ));
    }

    #[test]
    fn concurrent_register_and_deregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let (handle, _rx) = ChannelHandle::new(format!("u-{}", i % 2), 1);
                        let id = handle.id;
                        registry.register(handle);
                        registry.deregister(id);
                        registry.deregister(id);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.identities().is_empty());
    }
}
