use thiserror::Error;

use crate::entity::{SequenceId, SequenceStatus};

/// Unified error type for the lifecycle controller
#[derive(Debug, Error)]
pub enum SeqHookError {
    /// Spawning `child` under `parent` would make a sequence its own ancestor
    #[error("Cycle detected: sequence {child} is already an ancestor of {parent}")]
    CycleDetected {
        parent: SequenceId,
        child: SequenceId,
    },

    /// Spawn depth bound reached
    #[error("Max spawn depth exceeded under {parent}: depth {depth} > limit {limit}")]
    MaxDepthExceeded {
        parent: SequenceId,
        depth: usize,
        limit: usize,
    },

    /// Per-parent fan-out bound reached
    #[error("Child limit reached for {parent} (current: {current}, limit: {limit})")]
    ChildLimitExceeded {
        parent: SequenceId,
        current: usize,
        limit: usize,
    },

    /// Live sequence bound reached
    #[error("Capacity exhausted: {live} live sequences (limit: {limit})")]
    CapacityExhausted { live: usize, limit: usize },

    /// Signal payload could not be parsed
    #[error("Malformed {signal} payload from sequence {seq_id}: {message}")]
    MalformedPayload {
        seq_id: SequenceId,
        signal: String,
        message: String,
    },

    #[error("Sequence not found: {seq_id}")]
    SequenceNotFound { seq_id: SequenceId },

    #[error("Sequence already exists: {seq_id}")]
    DuplicateSequence { seq_id: SequenceId },

    #[error("Invalid status transition for {seq_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        seq_id: SequenceId,
        from: SequenceStatus,
        to: SequenceStatus,
    },

    /// Child whose parent is gone
    #[error("Orphaned child {child}: parent {parent} is no longer live")]
    OrphanedChild {
        child: SequenceId,
        parent: SequenceId,
    },

    /// Cached prefix state was evicted while the sequence was blocked
    #[error("Cached state for {seq_id} reclaimed during block ({prefix_len} prefix tokens lost)")]
    ResourceReclaimedDuringBlock { seq_id: SequenceId, prefix_len: usize },

    /// An external collaborator (scheduler, tokenizer, cache store) failed
    #[error("Collaborator {collaborator} failed during {operation}: {message}")]
    Collaborator {
        collaborator: String,
        operation: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel error: {channel} - {message}")]
    Channel { channel: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SeqHookError {
    /// Create a collaborator error from an `anyhow` failure
    pub fn collaborator<C: Into<String>, O: Into<String>>(
        collaborator: C,
        operation: O,
        err: &anyhow::Error,
    ) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            operation: operation.into(),
            message: format!("{:#}", err),
        }
    }

    /// Create a malformed payload error
    pub fn malformed<S: Into<String>, M: Into<String>>(seq_id: SequenceId, signal: S, message: M) -> Self {
        Self::MalformedPayload {
            seq_id,
            signal: signal.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a channel error
    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the affected sequence can keep running after this error.
    ///
    /// Spawn rejections and payload errors only drop the offending signal;
    /// the sequence that emitted it continues generating.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::CycleDetected { .. }
            | Self::MaxDepthExceeded { .. }
            | Self::ChildLimitExceeded { .. }
            | Self::CapacityExhausted { .. }
            | Self::MalformedPayload { .. }
            | Self::ResourceReclaimedDuringBlock { .. }
            | Self::DuplicateSequence { .. } => true,
            Self::Collaborator { .. } | Self::Channel { .. } | Self::Io { .. } => true,
            Self::OrphanedChild { .. } => false,
            Self::SequenceNotFound { .. } | Self::InvalidTransition { .. } => false,
            Self::Configuration { .. } | Self::Serialization { .. } | Self::Internal { .. } => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::CycleDetected { .. } => "cycle",
            Self::MaxDepthExceeded { .. } => "max_depth",
            Self::ChildLimitExceeded { .. } | Self::CapacityExhausted { .. } => "resource",
            Self::MalformedPayload { .. } => "payload",
            Self::SequenceNotFound { .. } | Self::DuplicateSequence { .. } => "entity",
            Self::InvalidTransition { .. } => "transition",
            Self::OrphanedChild { .. } => "orphan",
            Self::ResourceReclaimedDuringBlock { .. } => "reclaimed",
            Self::Collaborator { .. } => "collaborator",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Channel { .. } => "channel",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SeqHookError>;

impl From<std::io::Error> for SeqHookError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for SeqHookError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for SeqHookError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<bincode::Error> for SeqHookError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization("bincode", err)
    }
}

impl From<anyhow::Error> for SeqHookError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}
