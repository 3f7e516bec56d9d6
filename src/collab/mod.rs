//! External collaborators consumed by the controller
//!
//! The engine owns tokenization, scheduling and the cached-state store. The
//! controller only talks to them through these traits. Failures are reported
//! as `anyhow::Result` and turned into per-sequence outcomes by the caller.

pub mod sim;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::coord::ChildDescriptor;
use crate::entity::{SequenceId, TokenId};

/// Engine-side state of a sequence as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Waiting,
    Running,
    Blocked,
    Freed,
}

/// Engine scheduler
pub trait Scheduler: Send {
    /// Admit a spawned child. Returns the id the engine tracks it under.
    fn admit(&mut self, child: &ChildDescriptor) -> Result<SequenceId>;

    /// Stop scheduling `id` until it is marked runnable again.
    fn mark_blocked(&mut self, id: SequenceId) -> Result<()>;

    /// Resume `id`, recomputing state from token index `prefill_from`.
    fn mark_runnable(&mut self, id: SequenceId, prefill_from: usize) -> Result<()>;

    /// Release every resource held for `id`.
    fn free(&mut self, id: SequenceId) -> Result<()>;

    /// Current engine-side state, `None` when the scheduler does not track `id`.
    fn status(&self, id: SequenceId) -> Option<SchedulerState>;
}

/// Text <-> token conversion
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    fn decode(&self, tokens: &[TokenId]) -> Result<String>;
}

/// Residency query against the cached-state (KV) store
pub trait CacheStore: Send + Sync {
    /// Number of leading tokens of `id` whose computed state is still resident.
    fn resident_prefix(&self, id: SequenceId) -> usize;
}
