//! Application layer - Use cases and application services
//!
//! Read-only views over the registry, the account table and the call bridge,
//! shared by the HTTP API and the console.

pub mod admin;

pub use admin::{AccountSummary, AdminView, CallSummary, Registration};
