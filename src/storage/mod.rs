pub mod kv;
pub mod sessions;


pub use kv::*;
pub use sessions::*;
