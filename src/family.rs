use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;
use crate::sync::diff::Patch;

/// A diff one instance sent, offered to co-located members of its family.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyDiff {
    pub family_id: String,
    pub instance_id: String,
    pub patch: Patch,
}

/// In-process side channel keyed by `taskChange-<familyId>`, independent of
/// the hub connection.
#[derive(Debug, Clone, Default)]
pub struct FamilyBroadcaster {
    topics: Arc<parking_lot::RwLock<HashMap<String, broadcast::Sender<FamilyDiff>>>>,
}

impl FamilyBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(family_id: &str) -> String {
        format!("taskChange-{}", family_id)
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<FamilyDiff> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    pub fn subscribe(&self, family_id: &str) -> broadcast::Receiver<FamilyDiff> {
        self.sender_for(&Self::topic(family_id)).subscribe()
    }

    /// Returns how many subscribers saw the diff; zero is not an error.
    pub fn publish(&self, diff: FamilyDiff) -> usize {
        let topic = Self::topic(&diff.family_id);
        let sender = self.sender_for(&topic);
        let delivered = sender.send(diff).unwrap_or(0);
        trace!(%topic, delivered, "family diff published");
        delivered
    }
}
