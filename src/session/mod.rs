pub mod machine;
pub mod types;
pub mod worker;


pub use machine::*;
pub use types::*;
pub use worker::SessionConfig;
