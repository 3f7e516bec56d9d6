// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod limits;
}

// Lifecycle components, leaves first
pub mod entity; // Sequence records and their status
pub mod graph; // Parent/child bookkeeping
pub mod detect; // Spawn/sync/return signal detection
pub mod merge; // Child result combination
pub mod resume; // Recompute range planning
pub mod collab; // Engine collaborators
pub mod coord; // Per-tick controller and its service

// Re-exports for convenience
pub use core::config::{ControllerConfig, ControllerConfigBuilder};
pub use core::errors::{Result, SeqHookError};
pub use core::limits::SpawnLimits;

pub use collab::{CacheStore, Scheduler, SchedulerState, Tokenizer};
pub use coord::{
    ChildDescriptor, ControllerState, ControllerStats, EngineFinish, LifecycleController, LifecycleService,
    ResumeDirective, RootSpec, SequenceOutput, ServiceHandle, Snapshot, SpawnRejection, TickReport,
};
pub use detect::{Event, ParseError, PayloadFormat, SignalDetector, SignalGrammar};
pub use entity::{Sequence, SequenceId, SequenceStatus, TokenId};
pub use graph::{ChildResult, DependencyGraph, MergeRecord};
pub use merge::{CombinerRegistry, FnCombiner, MergeStrategy, ResultMerger};
pub use resume::{ResumePlan, ResumePlanner};
