//! Registry interface

use super::entity::{ContactInstance, ContactSet};
use crate::domain::shared::{Result, SipUri};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Address-of-record registry.
///
/// Two notions of "same AOR" are in use: `add_or_update`, `remove` and
/// `is_registered` compare the full URI, while `update_contact`,
/// `remove_contact` and `get_contacts` match on the user part only so a
/// callee addressed under another domain alias still routes.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Insert or refresh `instance` under `aor`, creating the entry if needed
    async fn add_or_update(&self, aor: &SipUri, instance: ContactInstance);

    /// Drop the whole entry for `aor`
    async fn remove(&self, aor: &SipUri);

    /// Whether an entry exists for exactly `aor`. Expiry is not checked.
    async fn is_registered(&self, aor: &SipUri) -> bool;

    /// Upsert `instance` into the entry matching `aor`'s user part
    async fn update_contact(&self, aor: &SipUri, instance: ContactInstance) -> Result<()>;

    /// Remove the instance with `instance.source` from the entry matching
    /// `aor`'s user part. An emptied entry is dropped.
    async fn remove_contact(&self, aor: &SipUri, instance: &ContactInstance) -> Result<()>;

    /// Instances of the entry matching `aor`'s user part
    async fn get_contacts(&self, aor: &SipUri) -> Option<ContactSet>;

    /// Snapshot of every AOR and its instances
    async fn get_all_contacts(&self) -> HashMap<SipUri, ContactSet>;

    /// Purge every instance bound to `source`. Returns whether anything was removed.
    async fn handle_connection_loss(&self, source: SocketAddr) -> bool;

    /// Number of AOR entries
    async fn aor_count(&self) -> usize;
}
