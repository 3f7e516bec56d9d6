//! Lifecycle coordination
//!
//! The synchronous per-tick controller, the types it exchanges with the
//! engine, its event stream, and the async service that owns it.

pub mod controller;
pub mod events;
pub mod service;
pub mod snapshot;
pub mod stats;
pub mod types;

pub use controller::*;
pub use events::*;
pub use service::*;
pub use snapshot::*;
pub use stats::*;
pub use types::*;
