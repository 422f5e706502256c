//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The SIP stack (transports, dispatch, user agent)
//! - The registrar and call bridge built on it

pub mod protocols;
