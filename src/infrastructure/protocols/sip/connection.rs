//! Purging registrations bound to a lost connection

use crate::domain::registry::Registry;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Notification that a stream connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    /// Remote end of the lost connection
    pub source: SocketAddr,
    /// Local end of the lost connection
    pub destination: SocketAddr,
    pub network: String,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {} lost", self.network, self.source, self.destination)
    }
}

pub struct ConnectionLossHandler {
    registry: Arc<dyn Registry>,
}

impl ConnectionLossHandler {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Unbind every contact that registered over the lost connection
    pub async fn handle(&self, error: &ConnectionError) -> bool {
        debug!("Handling connection error: {}", error);

        let removed = self.registry.handle_connection_loss(error.source).await;
        if removed {
            info!("Purged registrations bound to {}", error.source);
            metrics::gauge!("sip_registered_aors").set(self.registry.aor_count().await as f64);
        }
        removed
    }
}
