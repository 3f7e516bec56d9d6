//! In-process collaborators for tests and local runs

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{CacheStore, Scheduler, SchedulerState, Tokenizer};
use crate::coord::ChildDescriptor;
use crate::entity::{SequenceId, TokenId};

/// One token per Unicode scalar value
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(text.chars().map(|c| c as TokenId).collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        tokens
            .iter()
            .map(|&t| char::from_u32(t).ok_or_else(|| anyhow!("token {} is not a scalar value", t)))
            .collect()
    }
}

/// A scheduler call as seen by [`RecordingScheduler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    Admit(SequenceId),
    MarkBlocked(SequenceId),
    MarkRunnable { id: SequenceId, prefill_from: usize },
    Free(SequenceId),
}

/// Shared view of the calls a [`RecordingScheduler`] received
#[derive(Debug, Clone, Default)]
pub struct SchedulerLog {
    calls: Arc<Mutex<Vec<SchedulerCall>>>,
}

impl SchedulerLog {
    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn push(&self, call: SchedulerCall) {
        self.calls.lock().push(call);
    }
}

/// Scheduler that records every call and tracks engine-side state
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    log: SchedulerLog,
    states: HashMap<SequenceId, SchedulerState>,
    refuse_admission: bool,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every admission, as an engine out of capacity would.
    pub fn refusing() -> Self {
        Self {
            refuse_admission: true,
            ..Self::default()
        }
    }

    pub fn log(&self) -> SchedulerLog {
        self.log.clone()
    }
}

impl Scheduler for RecordingScheduler {
    fn admit(&mut self, child: &ChildDescriptor) -> Result<SequenceId> {
        if self.refuse_admission {
            return Err(anyhow!("scheduler refused sequence {}", child.id));
        }
        self.log.push(SchedulerCall::Admit(child.id));
        self.states.insert(child.id, SchedulerState::Waiting);
        Ok(child.id)
    }

    fn mark_blocked(&mut self, id: SequenceId) -> Result<()> {
        self.log.push(SchedulerCall::MarkBlocked(id));
        self.states.insert(id, SchedulerState::Blocked);
        Ok(())
    }

    fn mark_runnable(&mut self, id: SequenceId, prefill_from: usize) -> Result<()> {
        self.log.push(SchedulerCall::MarkRunnable { id, prefill_from });
        self.states.insert(id, SchedulerState::Waiting);
        Ok(())
    }

    fn free(&mut self, id: SequenceId) -> Result<()> {
        self.log.push(SchedulerCall::Free(id));
        self.states.insert(id, SchedulerState::Freed);
        Ok(())
    }

    fn status(&self, id: SequenceId) -> Option<SchedulerState> {
        self.states.get(&id).copied()
    }
}

/// Cache store where selected sequences have lost their resident state
#[derive(Debug, Clone, Default)]
pub struct EvictionCacheStore {
    evicted: Arc<RwLock<HashSet<SequenceId>>>,
}

impl EvictionCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evict(&self, id: SequenceId) {
        self.evicted.write().insert(id);
    }

    pub fn restore(&self, id: SequenceId) {
        self.evicted.write().remove(&id);
    }
}

impl CacheStore for EvictionCacheStore {
    fn resident_prefix(&self, id: SequenceId) -> usize {
        if self.evicted.read().contains(&id) {
            0
        } else {
            usize::MAX
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_tokenizer_is_reversible() {
        let tokenizer = CharTokenizer;
        let tokens = tokenizer.encode("r1\nλ").unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokenizer.decode(&tokens).unwrap(), "r1\nλ");
        assert!(tokenizer.decode(&[0xD800]).is_err());
    }

    #[test]
    fn test_eviction_store() {
        let store = EvictionCacheStore::new();
        assert_eq!(store.resident_prefix(1), usize::MAX);
        store.clone().evict(1);
        assert_eq!(store.resident_prefix(1), 0);
        store.restore(1);
        assert_eq!(store.resident_prefix(1), usize::MAX);
    }
}
