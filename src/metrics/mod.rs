pub mod engine;
pub mod types;

#[cfg(test)]
mod tests;

pub use engine::*;
pub use types::*;
