//! Pushing finished sessions to external health platforms.

pub mod manager;
pub mod platform;
pub mod rest;
pub mod types;

#[cfg(test)]
mod tests;

pub use manager::*;
pub use platform::*;
pub use rest::*;
pub use types::*;
