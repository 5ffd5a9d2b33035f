pub mod coordination_store;

pub use coordination_store::*;
