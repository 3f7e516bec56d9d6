//! Events produced by signal detection

use serde::{Deserialize, Serialize};

use crate::entity::{Priority, SamplingOverrides, SequenceId};
use crate::merge::MergeStrategy;

/// Kind of lifecycle signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Spawn,
    Sync,
    Return,
}

impl SignalKind {
    /// Application order within one sequence and tick
    pub fn rank(&self) -> u8 {
        match self {
            Self::Spawn => 0,
            Self::Sync => 1,
            Self::Return => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Sync => "sync",
            Self::Return => "return",
        }
    }
}

/// Parsed spawn payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub prompt: String,
    /// Requested child id; allocated by the store when absent
    #[serde(default)]
    pub child_id: Option<SequenceId>,
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub sampling: SamplingOverrides,
}

impl SpawnRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            child_id: None,
            merge_strategy: None,
            priority: None,
            sampling: SamplingOverrides::default(),
        }
    }

    pub fn with_child_id(mut self, id: SequenceId) -> Self {
        self.child_id = Some(id);
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = Some(strategy);
        self
    }
}

/// A lifecycle signal detected in a sequence's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    Spawn {
        parent_id: SequenceId,
        request: SpawnRequest,
        token_offset: usize,
    },
    Sync {
        parent_id: SequenceId,
        /// `None` waits on every child registered when the sync is applied
        targets: Option<Vec<SequenceId>>,
        token_offset: usize,
    },
    Return {
        child_id: SequenceId,
        text: String,
        token_offset: usize,
    },
}

impl Event {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Spawn { .. } => SignalKind::Spawn,
            Self::Sync { .. } => SignalKind::Sync,
            Self::Return { .. } => SignalKind::Return,
        }
    }

    /// Sequence whose output produced the event
    pub fn origin(&self) -> SequenceId {
        match self {
            Self::Spawn { parent_id, .. } | Self::Sync { parent_id, .. } => *parent_id,
            Self::Return { child_id, .. } => *child_id,
        }
    }

    pub fn token_offset(&self) -> usize {
        match self {
            Self::Spawn { token_offset, .. }
            | Self::Sync { token_offset, .. }
            | Self::Return { token_offset, .. } => *token_offset,
        }
    }
}

/// Why a signal could not be turned into an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// Payload present but unparsable
    InvalidPayload,
    /// Closing delimiter not seen within the lookahead window
    LookaheadExceeded,
    /// A new signal opened before the previous one closed
    Unterminated,
}

/// Distinguishable outcome for a malformed signal. Logged and otherwise
/// ignored; the sequence keeps generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub seq_id: SequenceId,
    pub signal: Option<SignalKind>,
    pub kind: ParseErrorKind,
    pub token_offset: usize,
    pub message: String,
}
