//! Registry domain - address-of-record to contact bindings

pub mod entity;
pub mod memory;
pub mod repository;

pub use entity::{ContactInstance, ContactSet};
pub use memory::MemoryRegistry;
pub use repository::Registry;
