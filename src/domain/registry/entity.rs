//! Contact instance entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// One reachable location registered for an address-of-record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInstance {
    /// Contact URI announced by the device
    pub contact: String,
    /// Requested registration lifetime in seconds
    pub reg_expires: u32,
    pub last_updated: DateTime<Utc>,
    /// Address the registration arrived from; also the per-connection key
    pub source: SocketAddr,
    pub user_agent: String,
    /// Transport name, e.g. `udp` or `tcp`
    pub transport: String,
}

impl ContactInstance {
    pub fn new(
        contact: impl Into<String>,
        reg_expires: u32,
        source: SocketAddr,
        user_agent: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            contact: contact.into(),
            reg_expires,
            last_updated: Utc::now(),
            source,
            user_agent: user_agent.into(),
            transport: transport.into(),
        }
    }
}

/// Contact instances of one AOR, keyed by source address
pub type ContactSet = HashMap<SocketAddr, ContactInstance>;
