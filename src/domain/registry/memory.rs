//! In-memory registry guarded by a single mutex

use super::entity::{ContactInstance, ContactSet};
use super::repository::Registry;
use crate::domain::shared::{DomainError, Result, SipUri};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// In-memory registry.
///
/// Every operation takes the one lock for its whole duration, so mutations
/// on the same AOR are linearized and no caller ever observes an entry
/// without instances.
pub struct MemoryRegistry {
    aors: Mutex<HashMap<SipUri, ContactSet>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            aors: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Key of the entry routed to by `aor`: an exact match wins, otherwise the
/// first entry with the same user part.
fn find_key(aors: &HashMap<SipUri, ContactSet>, aor: &SipUri) -> Option<SipUri> {
    if aors.contains_key(aor) {
        return Some(aor.clone());
    }
    aors.keys().find(|key| key.same_user(aor)).cloned()
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn add_or_update(&self, aor: &SipUri, instance: ContactInstance) {
        let mut aors = self.aors.lock().await;
        debug!("Binding {} -> {} ({})", aor, instance.contact, instance.source);
        aors.entry(aor.clone())
            .or_default()
            .insert(instance.source, instance);
    }

    async fn remove(&self, aor: &SipUri) {
        let mut aors = self.aors.lock().await;
        if aors.remove(aor).is_some() {
            info!("Removed AOR {}", aor);
        }
    }

    async fn is_registered(&self, aor: &SipUri) -> bool {
        self.aors.lock().await.contains_key(aor)
    }

    async fn update_contact(&self, aor: &SipUri, instance: ContactInstance) -> Result<()> {
        let mut aors = self.aors.lock().await;
        let key = find_key(&aors, aor)
            .ok_or_else(|| DomainError::NotFound(format!("no instances for {}", aor)))?;

        if let Some(instances) = aors.get_mut(&key) {
            instances.insert(instance.source, instance);
        }
        Ok(())
    }

    async fn remove_contact(&self, aor: &SipUri, instance: &ContactInstance) -> Result<()> {
        let mut aors = self.aors.lock().await;
        let key = find_key(&aors, aor)
            .ok_or_else(|| DomainError::NotFound(format!("no instances for {}", aor)))?;

        let emptied = match aors.get_mut(&key) {
            Some(instances) => {
                instances.remove(&instance.source);
                instances.is_empty()
            }
            None => false,
        };

        if emptied {
            aors.remove(&key);
            debug!("Last contact of {} removed, dropping AOR", key);
        }
        Ok(())
    }

    async fn get_contacts(&self, aor: &SipUri) -> Option<ContactSet> {
        let aors = self.aors.lock().await;
        find_key(&aors, aor).and_then(|key| aors.get(&key).cloned())
    }

    async fn get_all_contacts(&self) -> HashMap<SipUri, ContactSet> {
        self.aors.lock().await.clone()
    }

    async fn handle_connection_loss(&self, source: SocketAddr) -> bool {
        let mut aors = self.aors.lock().await;
        let mut removed = false;

        aors.retain(|aor, instances| {
            if instances.remove(&source).is_some() {
                info!("Connection {} lost, unbinding contact of {}", source, aor);
                removed = true;
            }
            !instances.is_empty()
        });

        removed
    }

    async fn aor_count(&self) -> usize {
        self.aors.lock().await.len()
    }
}
