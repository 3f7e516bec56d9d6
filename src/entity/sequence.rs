//! Sequence records tracked by the lifecycle controller.
//!
//! A sequence is one generation task. It owns an append-only token buffer
//! (prompt followed by generated and merged tokens), a core status, and its
//! position in the spawn tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SeqHookError};
use crate::merge::MergeStrategy;

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Token id produced by the tokenizer collaborator.
pub type TokenId = u32;

/// Scheduling priority. Higher values are more important.
pub type Priority = i32;

/// Default priority for new sequences.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Core status of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceStatus {
    Pending,
    Running,
    BlockedSync,
    Resuming,
    Finished,
    Failed,
    Cancelled,
}

impl SequenceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    /// Whether the engine may run compute for this sequence.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Resuming)
    }

    pub fn can_transition_to(&self, next: SequenceStatus) -> bool {
        use SequenceStatus::*;
        match (self, next) {
            (Finished | Failed | Cancelled, _) => false,
            (_, Failed | Cancelled) => true,
            (Pending, Running | Finished) => true,
            (Running, BlockedSync | Resuming | Finished) => true,
            (BlockedSync, Resuming) => true,
            (Resuming, Running | BlockedSync) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::BlockedSync => "BLOCKED_SYNC",
            Self::Resuming => "RESUMING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Dependency state of a sequence acting as a parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentState {
    Independent,
    ParentActive,
    ParentBlocked,
    ParentResuming,
}

/// Dependency state of a sequence acting as a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildState {
    ChildPending,
    ChildFinished,
    /// Result was read by the parent's merge; the child may be released.
    ChildMerged,
}

/// Why a sequence reached a terminal status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// Engine stopped generation (EOS, stop string, max tokens).
    Stop,
    /// A return signal supplied the completion result.
    Return,
    /// Engine or collaborator failure.
    Error(String),
    /// Cancelled by an operator or an ancestor's cascade.
    Cancelled,
    /// Parent disappeared before the result could be merged.
    Orphaned,
}

/// Sampling configuration inherited by spawned children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: 512,
            stop: Vec::new(),
        }
    }
}

/// Per-spawn overrides on top of the parent's sampling config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOverrides {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<usize>,
    pub stop: Option<Vec<String>>,
}

impl SamplingOverrides {
    pub fn apply(&self, base: &SamplingParams) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature.unwrap_or(base.temperature),
            top_p: self.top_p.unwrap_or(base.top_p),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            stop: self.stop.clone().unwrap_or_else(|| base.stop.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.top_p.is_none()
            && self.max_tokens.is_none()
            && self.stop.is_none()
    }
}

/// One generation task.
///
/// Fields guarded by lifecycle invariants (status, token buffer, child list,
/// prefill index) are private and only change through methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: SequenceId,
    pub parent_id: Option<SequenceId>,
    child_ids: Vec<SequenceId>,
    status: SequenceStatus,
    parent_state: ParentState,
    child_state: Option<ChildState>,
    token_ids: Vec<TokenId>,
    prompt_len: usize,
    output_text: String,
    result_override: Option<String>,
    pub merge_strategy: MergeStrategy,
    pub spawn_depth: usize,
    pub priority: Priority,
    pub sampling: SamplingParams,
    pub created_at: DateTime<Utc>,
    prefill_start_index: usize,
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Create a root sequence admitted by the engine.
    pub fn new_root(
        id: SequenceId,
        prompt_token_ids: Vec<TokenId>,
        sampling: SamplingParams,
        merge_strategy: MergeStrategy,
        priority: Priority,
        created_at: DateTime<Utc>,
    ) -> Self {
        let prompt_len = prompt_token_ids.len();
        Self {
            id,
            parent_id: None,
            child_ids: Vec::new(),
            status: SequenceStatus::Pending,
            parent_state: ParentState::Independent,
            child_state: None,
            token_ids: prompt_token_ids,
            prompt_len,
            output_text: String::new(),
            result_override: None,
            merge_strategy,
            spawn_depth: 0,
            priority,
            sampling,
            created_at,
            prefill_start_index: 0,
            finish_reason: None,
        }
    }

    /// Create a child spawned by `parent`.
    ///
    /// The child inherits sampling, merge strategy and priority unless
    /// overridden; its depth is one below the parent.
    pub fn new_child(
        id: SequenceId,
        parent: &Sequence,
        prompt_token_ids: Vec<TokenId>,
        overrides: &SamplingOverrides,
        merge_strategy: Option<MergeStrategy>,
        priority: Option<Priority>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let prompt_len = prompt_token_ids.len();
        Self {
            id,
            parent_id: Some(parent.id),
            child_ids: Vec::new(),
            status: SequenceStatus::Pending,
            parent_state: ParentState::Independent,
            child_state: Some(ChildState::ChildPending),
            token_ids: prompt_token_ids,
            prompt_len,
            output_text: String::new(),
            result_override: None,
            merge_strategy: merge_strategy.unwrap_or_else(|| parent.merge_strategy.clone()),
            spawn_depth: parent.spawn_depth + 1,
            priority: priority.unwrap_or(parent.priority),
            sampling: overrides.apply(&parent.sampling),
            created_at,
            prefill_start_index: 0,
            finish_reason: None,
        }
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, returning the previous status.
    pub fn transition(&mut self, next: SequenceStatus) -> Result<SequenceStatus> {
        if self.status == next {
            return Ok(next);
        }
        if !self.status.can_transition_to(next) {
            return Err(SeqHookError::InvalidTransition {
                seq_id: self.id,
                from: self.status,
                to: next,
            });
        }
        let prev = self.status;
        self.status = next;
        Ok(prev)
    }

    /// Terminal transition carrying the reason.
    pub fn terminate(&mut self, status: SequenceStatus, reason: FinishReason) -> Result<SequenceStatus> {
        debug_assert!(status.is_terminal());
        let prev = self.transition(status)?;
        self.finish_reason = Some(reason);
        Ok(prev)
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finish_reason.as_ref()
    }

    pub fn parent_state(&self) -> ParentState {
        self.parent_state
    }

    pub fn set_parent_state(&mut self, state: ParentState) {
        self.parent_state = state;
    }

    pub fn child_state(&self) -> Option<ChildState> {
        self.child_state
    }

    pub fn set_child_state(&mut self, state: ChildState) {
        if self.child_state.is_some() {
            self.child_state = Some(state);
        }
    }

    pub fn child_ids(&self) -> &[SequenceId] {
        &self.child_ids
    }

    /// Record a spawned child. Returns false if already present.
    pub fn add_child(&mut self, child: SequenceId) -> bool {
        if self.child_ids.contains(&child) {
            return false;
        }
        self.child_ids.push(child);
        true
    }

    pub fn token_ids(&self) -> &[TokenId] {
        &self.token_ids
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Append freshly generated tokens and their decoded text.
    pub fn append_generated(&mut self, tokens: &[TokenId], text: &str) {
        self.token_ids.extend_from_slice(tokens);
        self.output_text.push_str(text);
    }

    /// Append merge tokens out-of-band, returning the prefill start index
    /// (buffer length before the append).
    pub fn append_merged(&mut self, tokens: &[TokenId]) -> usize {
        let start = self.token_ids.len();
        self.token_ids.extend_from_slice(tokens);
        self.prefill_start_index = self.prefill_start_index.max(start);
        start
    }

    pub fn prefill_start_index(&self) -> usize {
        self.prefill_start_index
    }

    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    /// Set the canonical completion result supplied by a return signal.
    pub fn set_result(&mut self, text: impl Into<String>) {
        self.result_override = Some(text.into());
    }

    /// The result handed to the parent: the returned text if any, otherwise
    /// the generated output.
    pub fn completion_text(&self) -> &str {
        self.result_override.as_deref().unwrap_or(&self.output_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(id: SequenceId) -> Sequence {
        Sequence::new_root(
            id,
            vec![1, 2, 3],
            SamplingParams::default(),
            MergeStrategy::default(),
            DEFAULT_PRIORITY,
            Utc::now(),
        )
    }

    #[test]
    fn test_status_transitions() {
        let mut seq = root(1);
        assert_eq!(seq.status(), SequenceStatus::Pending);
        seq.transition(SequenceStatus::Running).unwrap();
        seq.transition(SequenceStatus::BlockedSync).unwrap();
        assert!(seq.transition(SequenceStatus::Running).is_err());
        seq.transition(SequenceStatus::Resuming).unwrap();
        seq.transition(SequenceStatus::BlockedSync).unwrap();
        seq.transition(SequenceStatus::Resuming).unwrap();
        seq.transition(SequenceStatus::Running).unwrap();
        seq.terminate(SequenceStatus::Finished, FinishReason::Stop).unwrap();
        assert!(seq.is_terminal());
        assert!(matches!(
            seq.transition(SequenceStatus::Cancelled),
            Err(SeqHookError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_child_inherits_with_overrides() {
        let mut parent = root(1);
        parent.sampling.temperature = 0.7;
        parent.priority = 5;
        let overrides = SamplingOverrides {
            max_tokens: Some(32),
            ..Default::default()
        };
        let child = Sequence::new_child(2, &parent, vec![9], &overrides, None, None, Utc::now());
        assert_eq!(child.parent_id, Some(1));
        assert_eq!(child.spawn_depth, 1);
        assert_eq!(child.priority, 5);
        assert_eq!(child.sampling.temperature, 0.7);
        assert_eq!(child.sampling.max_tokens, 32);
        assert_eq!(child.child_state(), Some(ChildState::ChildPending));
    }

    #[test]
    fn test_completion_text_prefers_returned_result() {
        let mut seq = root(1);
        seq.append_generated(&[4, 5], "raw output");
        assert_eq!(seq.completion_text(), "raw output");
        seq.set_result("final");
        assert_eq!(seq.completion_text(), "final");
        assert_eq!(seq.len(), 5);
        assert_eq!(seq.prompt_len(), 3);
    }

    #[test]
    fn test_merge_append_prefill_index() {
        let mut seq = root(1);
        seq.append_generated(&[4], "x");
        let start = seq.append_merged(&[7, 8]);
        assert_eq!(start, 4);
        assert_eq!(seq.prefill_start_index(), 4);
        let start = seq.append_merged(&[]);
        assert_eq!(start, 6);
        assert_eq!(seq.prefill_start_index(), 6);
    }

    #[test]
    fn test_add_child_is_unique() {
        let mut seq = root(1);
        assert!(seq.add_child(2));
        assert!(!seq.add_child(2));
        assert!(seq.add_child(3));
        assert_eq!(seq.child_ids(), &[2, 3]);
    }
}
