//! Repository implementations for database operations

pub mod experiment;
pub mod memory;
pub mod session;
pub mod step;

pub use experiment::*;
pub use memory::*;
pub use session::*;
pub use step::*;
