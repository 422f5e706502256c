//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - Value Objects: SIP URIs, call and session identifiers
//! - The address-of-record registry and its in-memory implementation
//! - The account table used for credential lookups

pub mod account;
pub mod registry;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
