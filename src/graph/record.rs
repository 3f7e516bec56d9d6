use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::entity::SequenceId;

/// Completion result of one child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildResult {
    pub child_id: SequenceId,
    pub text: String,
    /// Failure marker. Failed children carry an empty `text`.
    pub failed: bool,
}

impl ChildResult {
    pub fn finished(child_id: SequenceId, text: impl Into<String>) -> Self {
        Self {
            child_id,
            text: text.into(),
            failed: false,
        }
    }

    pub fn failed(child_id: SequenceId) -> Self {
        Self {
            child_id,
            text: String::new(),
            failed: true,
        }
    }
}

/// Frozen set of children a sync waits on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    /// Awaited children in spawn order
    pub children: Vec<SequenceId>,
    /// False when the sync named no targets and the snapshot was taken for it
    pub explicit: bool,
    pub requested_at: DateTime<Utc>,
}

/// Outcome of merging a sync target into its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub parent_id: SequenceId,
    pub merged_text: String,
    /// First token index of the parent needing fresh computation
    pub prefill_start_index: usize,
    /// Children whose results were merged, in spawn order
    pub children: Vec<SequenceId>,
    pub failed_children: Vec<SequenceId>,
    /// Merged after `max_blocked_duration` with only part of the target done
    pub forced: bool,
}

/// Per-parent dependency bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub parent_id: SequenceId,
    pub(crate) child_ids: Vec<SequenceId>,
    pub(crate) completed_children: BTreeSet<SequenceId>,
    pub(crate) child_results: BTreeMap<SequenceId, ChildResult>,
    pub(crate) sync_target: Option<SyncTarget>,
    pub(crate) blocked_since: Option<DateTime<Utc>>,
    pub(crate) merged_children: BTreeSet<SequenceId>,
    pub(crate) last_merge: Option<MergeRecord>,
}

impl DependencyRecord {
    pub fn new(parent_id: SequenceId) -> Self {
        Self {
            parent_id,
            child_ids: Vec::new(),
            completed_children: BTreeSet::new(),
            child_results: BTreeMap::new(),
            sync_target: None,
            blocked_since: None,
            merged_children: BTreeSet::new(),
            last_merge: None,
        }
    }

    pub fn child_ids(&self) -> &[SequenceId] {
        &self.child_ids
    }

    pub fn completed_children(&self) -> &BTreeSet<SequenceId> {
        &self.completed_children
    }

    pub fn result(&self, child: SequenceId) -> Option<&ChildResult> {
        self.child_results.get(&child)
    }

    pub fn results(&self) -> &BTreeMap<SequenceId, ChildResult> {
        &self.child_results
    }

    pub fn sync_target(&self) -> Option<&SyncTarget> {
        self.sync_target.as_ref()
    }

    pub fn blocked_since(&self) -> Option<DateTime<Utc>> {
        self.blocked_since
    }

    pub fn last_merge(&self) -> Option<&MergeRecord> {
        self.last_merge.as_ref()
    }

    pub fn is_merged(&self, child: SequenceId) -> bool {
        self.merged_children.contains(&child)
    }

    /// Registered children whose results have not yet been merged
    pub fn unmerged_children(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.child_ids
            .iter()
            .copied()
            .filter(move |c| !self.merged_children.contains(c))
    }

    /// Sync target members that have not completed
    pub fn pending_targets(&self) -> Vec<SequenceId> {
        self.sync_target
            .as_ref()
            .map(|t| {
                t.children
                    .iter()
                    .copied()
                    .filter(|c| !self.completed_children.contains(c))
                    .collect()
            })
            .unwrap_or_default()
    }
}
