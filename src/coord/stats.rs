use serde::{Deserialize, Serialize};

/// Running counters kept by the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub ticks: u64,
    pub roots_registered: u64,
    pub children_spawned: u64,
    pub spawns_rejected: u64,
    pub syncs_blocked: u64,
    pub merges: u64,
    pub forced_unblocks: u64,
    pub degraded_resumes: u64,
    pub parse_errors: u64,
    pub cancellations: u64,
    pub orphaned: u64,
    pub failures: u64,
    pub releases: u64,
    pub ignored_outputs: u64,
    /// Sequences currently held in the store
    pub live_sequences: usize,
    /// Sequences currently waiting on a sync
    pub blocked_sequences: usize,
}

impl ControllerStats {
    /// Fraction of resumes that had to recompute the whole sequence
    pub fn degraded_ratio(&self) -> f64 {
        if self.merges == 0 {
            0.0
        } else {
            self.degraded_resumes as f64 / self.merges as f64
        }
    }
}
