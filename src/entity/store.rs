use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::errors::{Result, SeqHookError};
use crate::entity::sequence::{Sequence, SequenceId, SequenceStatus};

/// Owns every live sequence record.
///
/// Released sequences are removed; `next_id` keeps growing so ids are never
/// reused within one store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityStore {
    sequences: BTreeMap<SequenceId, Sequence>,
    next_id: SequenceId,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id that no live sequence uses
    pub fn allocate_id(&mut self) -> SequenceId {
        while self.sequences.contains_key(&self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, seq: Sequence) -> Result<()> {
        if self.sequences.contains_key(&seq.id) {
            return Err(SeqHookError::DuplicateSequence { seq_id: seq.id });
        }
        self.next_id = self.next_id.max(seq.id.saturating_add(1));
        self.sequences.insert(seq.id, seq);
        Ok(())
    }

    pub fn remove(&mut self, id: SequenceId) -> Option<Sequence> {
        self.sequences.remove(&id)
    }

    pub fn contains(&self, id: SequenceId) -> bool {
        self.sequences.contains_key(&id)
    }

    pub fn get(&self, id: SequenceId) -> Option<&Sequence> {
        self.sequences.get(&id)
    }

    pub fn get_mut(&mut self, id: SequenceId) -> Option<&mut Sequence> {
        self.sequences.get_mut(&id)
    }

    pub fn require(&self, id: SequenceId) -> Result<&Sequence> {
        self.sequences
            .get(&id)
            .ok_or(SeqHookError::SequenceNotFound { seq_id: id })
    }

    pub fn require_mut(&mut self, id: SequenceId) -> Result<&mut Sequence> {
        self.sequences
            .get_mut(&id)
            .ok_or(SeqHookError::SequenceNotFound { seq_id: id })
    }

    pub fn status(&self, id: SequenceId) -> Option<SequenceStatus> {
        self.sequences.get(&id).map(|s| s.status())
    }

    /// Whether `id` exists and has not reached a terminal status
    pub fn is_live(&self, id: SequenceId) -> bool {
        self.status(id).map(|s| !s.is_terminal()).unwrap_or(false)
    }

    pub fn transition(&mut self, id: SequenceId, next: SequenceStatus) -> Result<SequenceStatus> {
        self.require_mut(id)?.transition(next)
    }

    /// Ancestor chain of `id`, nearest first. Stops at a released ancestor.
    pub fn ancestors(&self, id: SequenceId) -> Vec<SequenceId> {
        let mut chain = Vec::new();
        let mut cursor = self.get(id).and_then(|s| s.parent_id);
        while let Some(pid) = cursor {
            if chain.contains(&pid) {
                break;
            }
            chain.push(pid);
            cursor = self.get(pid).and_then(|s| s.parent_id);
        }
        chain
    }

    /// All descendants of `id` in breadth-first spawn order
    pub fn descendants(&self, id: SequenceId) -> Vec<SequenceId> {
        let mut out = Vec::new();
        let mut frontier: Vec<SequenceId> = self
            .get(id)
            .map(|s| s.child_ids().to_vec())
            .unwrap_or_default();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for child in frontier {
                if out.contains(&child) {
                    continue;
                }
                if let Some(seq) = self.get(child) {
                    next.extend_from_slice(seq.child_ids());
                }
                out.push(child);
            }
            frontier = next;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn ids_with_status(&self, status: SequenceStatus) -> Vec<SequenceId> {
        self.sequences
            .values()
            .filter(|s| s.status() == status)
            .map(|s| s.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.values()
    }
}
