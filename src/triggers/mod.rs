//! Trigger evaluation: turning metrics snapshots into coaching events.

pub mod engine;
pub mod types;


pub use engine::*;
pub use types::*;
