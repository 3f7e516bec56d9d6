//! Types exchanged between the engine and the lifecycle controller

use serde::{Deserialize, Serialize};

use crate::core::errors::SeqHookError;
use crate::detect::ParseError;
use crate::entity::{Priority, SamplingParams, SequenceId, TokenId};
use crate::graph::MergeRecord;
use crate::merge::MergeStrategy;

/// Engine-reported end of a sequence's generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineFinish {
    /// Stop token, length limit, or any normal completion
    Stop,
    /// The engine could not continue the sequence
    Failed(String),
}

/// What one sequence produced during one engine step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceOutput {
    pub seq_id: SequenceId,
    pub new_token_ids: Vec<TokenId>,
    /// Detokenized span; decoded by the controller when absent
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finished: Option<EngineFinish>,
}

impl SequenceOutput {
    pub fn new(seq_id: SequenceId, new_token_ids: Vec<TokenId>) -> Self {
        Self {
            seq_id,
            new_token_ids,
            text: None,
            finished: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished = Some(EngineFinish::Stop);
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.finished = Some(EngineFinish::Failed(reason.into()));
        self
    }
}

/// A root sequence admitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootSpec {
    /// Engine-assigned id; allocated by the store when absent
    pub id: Option<SequenceId>,
    pub prompt_token_ids: Vec<TokenId>,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl RootSpec {
    pub fn new(prompt_token_ids: Vec<TokenId>) -> Self {
        Self {
            id: None,
            prompt_token_ids,
            sampling: SamplingParams::default(),
            merge_strategy: None,
            priority: None,
        }
    }

    pub fn with_id(mut self, id: SequenceId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = Some(strategy);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A child the engine must start generating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildDescriptor {
    pub id: SequenceId,
    pub parent_id: SequenceId,
    pub prompt: String,
    pub prompt_token_ids: Vec<TokenId>,
    pub sampling: SamplingParams,
    pub priority: Priority,
    pub spawn_depth: usize,
}

/// A parent the engine must resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeDirective {
    pub seq_id: SequenceId,
    /// First token index to recompute
    pub prefill_from: usize,
    /// Tokens appended by the merge
    pub appended_tokens: usize,
    pub degraded: bool,
}

/// A spawn signal that did not produce a child
#[derive(Debug)]
pub struct SpawnRejection {
    pub parent_id: SequenceId,
    pub requested_child: Option<SequenceId>,
    pub token_offset: usize,
    pub reason: SeqHookError,
}

/// Everything the engine must act on after one tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub spawned: Vec<ChildDescriptor>,
    pub blocked: Vec<SequenceId>,
    pub resumed: Vec<ResumeDirective>,
    /// Sequences finished by the controller (return signal) that the engine must stop
    pub finished: Vec<SequenceId>,
    /// Sequences that ended FAILED during the tick
    pub failed: Vec<SequenceId>,
    pub cancelled: Vec<SequenceId>,
    /// Sequences whose resources were freed
    pub released: Vec<SequenceId>,
    pub rejected: Vec<SpawnRejection>,
    pub parse_errors: Vec<ParseError>,
    pub merges: Vec<MergeRecord>,
    /// Resumes that fell back to full recomputation
    pub degraded: Vec<SequenceId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.spawned.is_empty()
            && self.blocked.is_empty()
            && self.resumed.is_empty()
            && self.finished.is_empty()
            && self.failed.is_empty()
            && self.cancelled.is_empty()
            && self.released.is_empty()
            && self.rejected.is_empty()
            && self.parse_errors.is_empty()
            && self.merges.is_empty()
            && self.degraded.is_empty()
    }

    pub fn resumed_ids(&self) -> Vec<SequenceId> {
        self.resumed.iter().map(|r| r.seq_id).collect()
    }

    pub fn spawned_ids(&self) -> Vec<SequenceId> {
        self.spawned.iter().map(|c| c.id).collect()
    }
}
