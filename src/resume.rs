//! Conditional-resume planning
//!
//! On resume only the merged suffix appended to the parent needs fresh
//! computation. If the cached state of the parent's prefix was evicted while
//! it was blocked, the whole sequence is recomputed instead.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::collab::CacheStore;
use crate::entity::SequenceId;

/// Recompute range for a resuming sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePlan {
    /// First token index the engine must recompute
    pub recompute_from: usize,
    /// Tokens whose cached state is reused
    pub reused_prefix: usize,
    /// Prefix state was lost and the plan falls back to full recomputation
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResumePlanner;

impl ResumePlanner {
    pub fn new() -> Self {
        Self
    }

    /// Plan a resume of `seq_id` whose merged text starts at `prefill_start_index`.
    pub fn plan(&self, seq_id: SequenceId, prefill_start_index: usize, cache: &dyn CacheStore) -> ResumePlan {
        let resident = cache.resident_prefix(seq_id);
        if prefill_start_index > 0 && resident < prefill_start_index {
            warn!(
                seq_id,
                prefix_len = prefill_start_index,
                resident,
                "Cached prefix evicted while blocked, recomputing from 0"
            );
            return ResumePlan {
                recompute_from: 0,
                reused_prefix: 0,
                degraded: true,
            };
        }
        ResumePlan {
            recompute_from: prefill_start_index,
            reused_prefix: prefill_start_index,
            degraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::sim::EvictionCacheStore;

    struct Partial(usize);

    impl CacheStore for Partial {
        fn resident_prefix(&self, _id: SequenceId) -> usize {
            self.0
        }
    }

    #[test]
    fn test_plan_reuses_prefix() {
        let plan = ResumePlanner::new().plan(1, 12, &EvictionCacheStore::new());
        assert_eq!(
            plan,
            ResumePlan {
                recompute_from: 12,
                reused_prefix: 12,
                degraded: false
            }
        );
    }

    #[test]
    fn test_plan_degrades_on_eviction() {
        let cache = EvictionCacheStore::new();
        cache.evict(1);
        let plan = ResumePlanner::new().plan(1, 12, &cache);
        assert!(plan.degraded);
        assert_eq!(plan.recompute_from, 0);

        let plan = ResumePlanner::new().plan(1, 12, &Partial(8));
        assert!(plan.degraded);
        let plan = ResumePlanner::new().plan(1, 12, &Partial(12));
        assert!(!plan.degraded);
    }

    #[test]
    fn test_empty_prefix_never_degrades() {
        let cache = EvictionCacheStore::new();
        cache.evict(1);
        assert!(!ResumePlanner::new().plan(1, 0, &cache).degraded);
    }
}
