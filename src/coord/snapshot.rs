//! Controller state checkpoints and the dependency snapshot view

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::errors::Result;
use crate::entity::{EntityStore, SequenceId, SequenceStatus};
use crate::graph::{ChildResult, DependencyGraph};

/// Everything the controller mutates: the entity store and the dependency graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerState {
    pub store: EntityStore,
    pub graph: DependencyGraph,
}

impl ControllerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Per-sequence dependency view
    pub fn snapshot(&self) -> Snapshot {
        let sequences = self
            .store
            .iter()
            .map(|seq| {
                let record = self.graph.record(seq.id);
                let entry = SequenceSnapshot {
                    parent_id: seq.parent_id,
                    child_ids: seq.child_ids().to_vec(),
                    status: seq.status(),
                    completed_children: record
                        .map(|r| r.completed_children().iter().copied().collect())
                        .unwrap_or_default(),
                    results: record.map(|r| r.results().clone()).unwrap_or_default(),
                    sync_target: record.and_then(|r| r.sync_target()).map(|t| t.children.clone()),
                    blocked_since: record.and_then(|r| r.blocked_since()),
                };
                (seq.id, entry)
            })
            .collect();
        Snapshot { sequences }
    }
}

/// One sequence's entry in a [`Snapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSnapshot {
    pub parent_id: Option<SequenceId>,
    pub child_ids: Vec<SequenceId>,
    pub status: SequenceStatus,
    pub completed_children: Vec<SequenceId>,
    pub results: BTreeMap<SequenceId, ChildResult>,
    pub sync_target: Option<Vec<SequenceId>>,
    pub blocked_since: Option<DateTime<Utc>>,
}

/// `id -> {parent_id, child_ids, status, completed_children, results}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequences: BTreeMap<SequenceId, SequenceSnapshot>,
}

impl Snapshot {
    pub fn get(&self, id: SequenceId) -> Option<&SequenceSnapshot> {
        self.sequences.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn blocked(&self) -> Vec<SequenceId> {
        self.sequences
            .iter()
            .filter(|(_, s)| s.status == SequenceStatus::BlockedSync)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{SamplingOverrides, SamplingParams, Sequence, DEFAULT_PRIORITY};
    use crate::merge::MergeStrategy;
    use pretty_assertions::assert_eq;

    fn state() -> ControllerState {
        let mut state = ControllerState::new();
        let now = Utc::now();
        let mut root = Sequence::new_root(
            1,
            vec![1, 2, 3],
            SamplingParams::default(),
            MergeStrategy::labeled(),
            DEFAULT_PRIORITY,
            now,
        );
        let child = Sequence::new_child(2, &root, vec![4], &SamplingOverrides::default(), None, None, now);
        root.add_child(2);
        state.store.insert(root).unwrap();
        state.store.insert(child).unwrap();
        state.graph.register_child(1, 2).unwrap();
        state.graph.record_sync_request(1, None, now);
        state.graph.record_child_result(2, "r1", false);
        state
    }

    #[test]
    fn test_snapshot_shape() {
        let snapshot = state().snapshot();
        assert_eq!(snapshot.len(), 2);
        let root = snapshot.get(1).unwrap();
        assert_eq!(root.child_ids, vec![2]);
        assert_eq!(root.completed_children, vec![2]);
        assert_eq!(root.results[&2], ChildResult::finished(2, "r1"));
        assert_eq!(root.sync_target, Some(vec![2]));
        assert_eq!(snapshot.get(2).unwrap().parent_id, Some(1));
    }

    #[test]
    fn test_bincode_checkpoint() {
        let state = state();
        let bytes = state.to_bytes().unwrap();
        let restored = ControllerState::from_bytes(&bytes).unwrap();
        assert_eq!(restored.snapshot(), state.snapshot());
        assert_eq!(restored.store.get(1).unwrap().merge_strategy, MergeStrategy::labeled());
    }

    #[test]
    fn test_json_checkpoint() {
        let state = state();
        let restored = ControllerState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(restored.snapshot(), state.snapshot());
    }
}
