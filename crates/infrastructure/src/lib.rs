pub mod in_memory_store;
pub mod observability;

pub use in_memory_store::*;
pub use observability::*;
