//! Entity store: sequence records and their core status

pub mod sequence;
pub mod store;

pub use sequence::*;
pub use store::*;
