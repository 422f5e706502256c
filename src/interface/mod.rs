//! Interface layer - External interfaces
//!
//! This layer handles:
//! - The read-only HTTP admin API
//! - The interactive operator console

pub mod api;
pub mod console;
