use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::core::errors::{Result, SeqHookError};
use crate::entity::SequenceId;
use crate::graph::record::{ChildResult, DependencyRecord, MergeRecord, SyncTarget};

/// Parent/child bookkeeping for spawned sequences.
///
/// Single writer: only the lifecycle controller mutates the graph, once per
/// tick. Nothing here is synchronized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Parent id -> its dependency record
    records: BTreeMap<SequenceId, DependencyRecord>,
    /// Reverse index: child id -> parent id
    parent_of: BTreeMap<SequenceId, SequenceId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, parent: SequenceId) -> Option<&DependencyRecord> {
        self.records.get(&parent)
    }

    pub fn records(&self) -> impl Iterator<Item = &DependencyRecord> {
        self.records.values()
    }

    pub fn parent_of(&self, child: SequenceId) -> Option<SequenceId> {
        self.parent_of.get(&child).copied()
    }

    pub fn children(&self, parent: SequenceId) -> &[SequenceId] {
        self.records
            .get(&parent)
            .map(|r| r.child_ids())
            .unwrap_or(&[])
    }

    /// Whether registering `child` under `parent` would make some sequence
    /// its own ancestor. `ancestors` is the parent's chain (nearest first)
    /// as known to the entity store; the graph's own reverse index is
    /// consulted as well.
    pub fn would_create_cycle(&self, parent: SequenceId, child: SequenceId, ancestors: &[SequenceId]) -> bool {
        if child == parent || ancestors.contains(&child) {
            return true;
        }
        let mut cursor = Some(parent);
        let mut hops = 0usize;
        while let Some(id) = cursor {
            if id == child {
                return true;
            }
            hops += 1;
            if hops > self.parent_of.len() + 1 {
                // Corrupted index; treat as cyclic rather than loop forever.
                return true;
            }
            cursor = self.parent_of.get(&id).copied();
        }
        false
    }

    pub fn register_child(&mut self, parent: SequenceId, child: SequenceId) -> Result<()> {
        if let Some(existing) = self.parent_of.get(&child) {
            if *existing == parent {
                return Ok(());
            }
            return Err(SeqHookError::DuplicateSequence { seq_id: child });
        }
        let record = self
            .records
            .entry(parent)
            .or_insert_with(|| DependencyRecord::new(parent));
        if !record.child_ids.contains(&child) {
            record.child_ids.push(child);
        }
        self.parent_of.insert(child, parent);
        debug!(parent, child, "registered child");
        Ok(())
    }

    /// Snapshot the children a sync waits on.
    ///
    /// With `targets == None` the snapshot is every registered, not yet
    /// merged child at call time; children registered afterwards are not
    /// awaited. Explicit targets are filtered to registered, unmerged
    /// children of `parent`. A sync issued while another is pending keeps
    /// the pending one.
    pub fn record_sync_request(
        &mut self,
        parent: SequenceId,
        targets: Option<&[SequenceId]>,
        now: DateTime<Utc>,
    ) -> SyncTarget {
        let record = self
            .records
            .entry(parent)
            .or_insert_with(|| DependencyRecord::new(parent));

        if let Some(pending) = &record.sync_target {
            warn!(parent, "sync requested while another sync is pending; keeping the pending target");
            return pending.clone();
        }

        let children: Vec<SequenceId> = match targets {
            None => record.unmerged_children().collect(),
            Some(requested) => {
                for id in requested {
                    if !record.child_ids.contains(id) {
                        warn!(parent, target = *id, "sync target is not a child of this parent; ignoring");
                    } else if record.merged_children.contains(id) {
                        warn!(parent, target = *id, "sync target was already merged; ignoring");
                    }
                }
                record
                    .unmerged_children()
                    .filter(|c| requested.contains(c))
                    .collect()
            }
        };

        let target = SyncTarget {
            children,
            explicit: targets.is_some(),
            requested_at: now,
        };
        record.sync_target = Some(target.clone());
        target
    }

    /// Record a child's completion. Returns the parent id when this
    /// completion makes the parent's pending sync fully satisfied.
    ///
    /// The first recorded result for a child wins; later ones are ignored.
    pub fn record_child_result(&mut self, child: SequenceId, text: &str, failed: bool) -> Option<SequenceId> {
        let parent = *self.parent_of.get(&child)?;
        let record = self.records.get_mut(&parent)?;

        if record.completed_children.contains(&child) {
            debug!(parent, child, "child result already recorded");
            return None;
        }

        let result = if failed {
            ChildResult::failed(child)
        } else {
            ChildResult::finished(child, text)
        };
        record.completed_children.insert(child);
        record.child_results.insert(child, result);

        let awaited = record
            .sync_target
            .as_ref()
            .map(|t| t.children.contains(&child))
            .unwrap_or(false);
        if awaited && record.pending_targets().is_empty() {
            Some(parent)
        } else {
            None
        }
    }

    /// True when a sync target is recorded and every member has completed
    pub fn all_targets_done(&self, parent: SequenceId) -> bool {
        self.records
            .get(&parent)
            .map(|r| r.sync_target.is_some() && r.pending_targets().is_empty())
            .unwrap_or(false)
    }

    pub fn has_pending_sync(&self, parent: SequenceId) -> bool {
        self.records
            .get(&parent)
            .map(|r| r.sync_target.is_some())
            .unwrap_or(false)
    }

    pub fn pending_targets(&self, parent: SequenceId) -> Vec<SequenceId> {
        self.records
            .get(&parent)
            .map(|r| r.pending_targets())
            .unwrap_or_default()
    }

    /// Completed results for `targets`, in spawn order
    pub fn ordered_results(&self, parent: SequenceId, targets: &[SequenceId]) -> Vec<ChildResult> {
        let Some(record) = self.records.get(&parent) else {
            return Vec::new();
        };
        record
            .child_ids
            .iter()
            .filter(|c| targets.contains(c))
            .filter_map(|c| record.child_results.get(c).cloned())
            .collect()
    }

    pub fn mark_blocked(&mut self, parent: SequenceId, now: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(&parent) {
            record.blocked_since.get_or_insert(now);
        }
    }

    /// Parents blocked at or before `deadline`
    pub fn blocked_before(&self, deadline: DateTime<Utc>) -> Vec<SequenceId> {
        self.records
            .values()
            .filter(|r| r.blocked_since.map(|t| t <= deadline).unwrap_or(false))
            .map(|r| r.parent_id)
            .collect()
    }

    /// Shrink the pending sync target to the children that have completed.
    /// Returns the children dropped from the target.
    pub fn truncate_to_completed(&mut self, parent: SequenceId) -> Vec<SequenceId> {
        let Some(record) = self.records.get_mut(&parent) else {
            return Vec::new();
        };
        let dropped = record.pending_targets();
        if let Some(target) = record.sync_target.as_mut() {
            let completed = &record.completed_children;
            target.children.retain(|c| completed.contains(c));
        }
        dropped
    }

    /// Consume the pending sync target ahead of a merge
    pub fn take_sync_target(&mut self, parent: SequenceId) -> Option<SyncTarget> {
        let record = self.records.get_mut(&parent)?;
        record.blocked_since = None;
        record.sync_target.take()
    }

    /// Record a completed merge and mark its children as consumed
    pub fn commit_merge(&mut self, merge: MergeRecord) {
        let record = self
            .records
            .entry(merge.parent_id)
            .or_insert_with(|| DependencyRecord::new(merge.parent_id));
        for child in &merge.children {
            record.merged_children.insert(*child);
        }
        record.last_merge = Some(merge);
    }

    pub fn last_merge(&self, parent: SequenceId) -> Option<&MergeRecord> {
        self.records.get(&parent).and_then(|r| r.last_merge.as_ref())
    }

    /// Whether `parent` still holds children whose results were not merged
    pub fn has_unmerged_children(&self, parent: SequenceId) -> bool {
        self.records
            .get(&parent)
            .map(|r| r.unmerged_children().next().is_some())
            .unwrap_or(false)
    }

    /// Children of `parent` whose results have not been merged yet
    pub fn unmerged_count(&self, parent: SequenceId) -> usize {
        self.records
            .get(&parent)
            .map(|r| r.unmerged_children().count())
            .unwrap_or(0)
    }

    /// Whether a merge has already consumed `child`'s result
    pub fn is_merged(&self, child: SequenceId) -> bool {
        self.parent_of(child)
            .and_then(|p| self.records.get(&p))
            .map(|r| r.is_merged(child))
            .unwrap_or(false)
    }

    /// Drop everything the graph knows about a released sequence
    pub fn forget(&mut self, id: SequenceId) {
        self.records.remove(&id);
        self.parent_of.retain(|child, parent| *child != id && *parent != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph_with_children(parent: SequenceId, children: &[SequenceId]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for c in children {
            graph.register_child(parent, *c).unwrap();
        }
        graph
    }

    #[test]
    fn test_register_child_keeps_spawn_order() {
        let graph = graph_with_children(1, &[5, 3, 4]);
        assert_eq!(graph.children(1), &[5, 3, 4]);
        assert_eq!(graph.parent_of(3), Some(1));
    }

    #[test]
    fn test_child_has_single_parent() {
        let mut graph = graph_with_children(1, &[2]);
        assert!(graph.register_child(1, 2).is_ok());
        assert!(matches!(
            graph.register_child(7, 2),
            Err(SeqHookError::DuplicateSequence { seq_id: 2 })
        ));
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = graph_with_children(1, &[2]);
        graph.register_child(2, 3).unwrap();
        assert!(graph.would_create_cycle(3, 1, &[]));
        assert!(graph.would_create_cycle(3, 3, &[]));
        assert!(graph.would_create_cycle(3, 9, &[9]));
        assert!(!graph.would_create_cycle(3, 4, &[2, 1]));
    }

    #[test]
    fn test_sync_none_snapshots_current_children() {
        let mut graph = graph_with_children(1, &[2, 3]);
        let target = graph.record_sync_request(1, None, Utc::now());
        assert_eq!(target.children, vec![2, 3]);
        assert!(!target.explicit);

        graph.register_child(1, 4).unwrap();
        assert_eq!(graph.record_child_result(2, "a", false), None);
        assert_eq!(graph.record_child_result(3, "b", false), Some(1));
        assert!(graph.all_targets_done(1));
        assert_eq!(graph.pending_targets(1), Vec::<SequenceId>::new());
    }

    #[test]
    fn test_explicit_targets_filtered_to_children() {
        let mut graph = graph_with_children(1, &[2, 3]);
        let target = graph.record_sync_request(1, Some(&[3, 42]), Utc::now());
        assert_eq!(target.children, vec![3]);
        assert!(target.explicit);
        assert_eq!(graph.record_child_result(2, "x", false), None);
        assert!(!graph.all_targets_done(1));
        assert_eq!(graph.record_child_result(3, "y", false), Some(1));
    }

    #[test]
    fn test_failed_child_counts_as_completed() {
        let mut graph = graph_with_children(1, &[2]);
        graph.record_sync_request(1, None, Utc::now());
        assert_eq!(graph.record_child_result(2, "ignored", true), Some(1));
        let results = graph.ordered_results(1, &[2]);
        assert_eq!(results, vec![ChildResult::failed(2)]);
    }

    #[test]
    fn test_first_result_wins() {
        let mut graph = graph_with_children(1, &[2]);
        graph.record_child_result(2, "first", false);
        graph.record_child_result(2, "second", false);
        assert_eq!(graph.record(1).unwrap().result(2).unwrap().text, "first");
    }

    #[test]
    fn test_ordered_results_follow_spawn_order() {
        let mut graph = graph_with_children(1, &[4, 2, 3]);
        graph.record_child_result(3, "c", false);
        graph.record_child_result(2, "b", false);
        graph.record_child_result(4, "a", false);
        let texts: Vec<String> = graph
            .ordered_results(1, &[3, 2, 4])
            .into_iter()
            .map(|r| r.text)
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_merged_children_leave_next_snapshot() {
        let mut graph = graph_with_children(1, &[2, 3]);
        graph.record_sync_request(1, Some(&[2]), Utc::now());
        graph.record_child_result(2, "a", false);
        let target = graph.take_sync_target(1).unwrap();
        graph.commit_merge(MergeRecord {
            parent_id: 1,
            merged_text: "a".into(),
            prefill_start_index: 0,
            children: target.children,
            failed_children: vec![],
            forced: false,
        });
        assert!(graph.is_merged(2));
        let next = graph.record_sync_request(1, None, Utc::now());
        assert_eq!(next.children, vec![3]);
        assert!(graph.has_unmerged_children(1));
    }

    #[test]
    fn test_unmerged_count_shrinks_after_merge() {
        let mut graph = graph_with_children(1, &[2, 3]);
        assert_eq!(graph.unmerged_count(1), 2);
        graph.record_sync_request(1, Some(&[2]), Utc::now());
        graph.record_child_result(2, "a", false);
        let target = graph.take_sync_target(1).unwrap();
        graph.commit_merge(MergeRecord {
            parent_id: 1,
            merged_text: "a".to_string(),
            prefill_start_index: 4,
            children: target.children,
            failed_children: Vec::new(),
            forced: false,
        });
        assert_eq!(graph.unmerged_count(1), 1);
        assert_eq!(graph.unmerged_count(9), 0);
    }

    #[test]
    fn test_truncate_to_completed() {
        let mut graph = graph_with_children(1, &[2, 3, 4]);
        graph.record_sync_request(1, None, Utc::now());
        graph.record_child_result(2, "a", false);
        let dropped = graph.truncate_to_completed(1);
        assert_eq!(dropped, vec![3, 4]);
        assert_eq!(graph.record(1).unwrap().sync_target().unwrap().children, vec![2]);
        assert!(graph.all_targets_done(1));
    }

    #[test]
    fn test_blocked_before_and_forget() {
        let mut graph = graph_with_children(1, &[2]);
        let t0 = Utc::now();
        graph.record_sync_request(1, None, t0);
        graph.mark_blocked(1, t0);
        assert_eq!(graph.blocked_before(t0), vec![1]);
        assert!(graph.take_sync_target(1).is_some());
        assert!(graph.blocked_before(t0).is_empty());

        graph.forget(1);
        assert!(graph.record(1).is_none());
        assert_eq!(graph.parent_of(2), None);
    }
}
