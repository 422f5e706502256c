//! B2BUA - a back-to-back user agent with a built-in SIP registrar
//!
//! Devices REGISTER their contacts here; every INVITE is answered on one leg
//! and re-originated toward each registered contact of the callee on another.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;
pub mod logging;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
