//! Dependency graph: parent/child bookkeeping and completion tracking

pub mod dependency;
pub mod record;

pub use dependency::*;
pub use record::*;
