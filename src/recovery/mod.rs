pub mod store;
pub(crate) mod writer;


pub use store::*;
pub(crate) use writer::*;
