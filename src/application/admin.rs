//! Administrative view of the running B2BUA

use crate::domain::account::{Account, AccountTable};
use crate::domain::registry::{ContactInstance, Registry};
use crate::infrastructure::protocols::sip::CallBridge;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;

/// Account as exposed over HTTP; secrets stay on the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSummary {
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub id: String,
    pub source_contact: String,
    pub destination_contact: String,
    pub answered: bool,
    pub created_at: DateTime<Utc>,
}

/// One AOR and its contact instances
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub aor: String,
    pub instances: Vec<ContactInstance>,
}

#[derive(Clone)]
pub struct AdminView {
    accounts: Arc<AccountTable>,
    registry: Arc<dyn Registry>,
    bridge: Arc<CallBridge>,
}

impl AdminView {
    pub fn new(accounts: Arc<AccountTable>, registry: Arc<dyn Registry>, bridge: Arc<CallBridge>) -> Self {
        Self {
            accounts,
            registry,
            bridge,
        }
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.accounts.accounts().await
    }

    pub async fn account_summaries(&self) -> Vec<AccountSummary> {
        self.accounts
            .accounts()
            .await
            .into_iter()
            .map(|account| AccountSummary {
                username: account.username,
            })
            .collect()
    }

    pub async fn calls(&self) -> Vec<CallSummary> {
        self.bridge
            .calls()
            .await
            .into_iter()
            .map(|call| CallSummary {
                id: call.id.to_string(),
                source_contact: call.source_contact,
                destination_contact: call.destination_contact,
                answered: call.answered,
                created_at: call.created_at,
            })
            .collect()
    }

    /// Every AOR with its instances, ordered by AOR then source
    pub async fn registrations(&self) -> Vec<Registration> {
        let mut registrations: Vec<Registration> = self
            .registry
            .get_all_contacts()
            .await
            .into_iter()
            .map(|(aor, contacts)| {
                let mut instances: Vec<ContactInstance> = contacts.into_values().collect();
                instances.sort_by_key(|instance| instance.source);
                Registration {
                    aor: aor.to_string(),
                    instances,
                }
            })
            .collect();
        registrations.sort_by(|a, b| a.aor.cmp(&b.aor));
        registrations
    }

    pub async fn render_accounts(&self) -> String {
        let accounts = self.accounts().await;
        if accounts.is_empty() {
            return "No accounts\n".to_string();
        }

        let mut out = String::from("Accounts:\nUsername \t Password\n");
        for account in accounts {
            let _ = writeln!(out, "{} \t\t {}", account.username, account.password);
        }
        out
    }

    pub async fn render_calls(&self) -> String {
        let calls = self.bridge.calls().await;
        if calls.is_empty() {
            return "No active calls\n".to_string();
        }

        let mut out = String::from("Calls:\n");
        for call in calls {
            let _ = writeln!(out, "{}:", call);
        }
        out
    }

    pub async fn render_registrations(&self) -> String {
        let registrations = self.registrations().await;
        if registrations.is_empty() {
            return "No online devices\n".to_string();
        }

        let mut out = String::new();
        for registration in registrations {
            let _ = writeln!(out, "AOR: {}:", registration.aor);
            for instance in registration.instances {
                let _ = writeln!(
                    out,
                    "\t{}, expires: {}, source: {}, transport: {}",
                    instance.user_agent, instance.reg_expires, instance.source, instance.transport
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::MemoryRegistry;
    use crate::domain::shared::SipUri;
    use crate::infrastructure::protocols::sip::session::MockSessionLayer;

    fn view() -> (AdminView, Arc<AccountTable>, Arc<MemoryRegistry>) {
        let accounts = Arc::new(AccountTable::new());
        let registry = Arc::new(MemoryRegistry::new());
        let bridge = Arc::new(CallBridge::new(registry.clone(), Arc::new(MockSessionLayer::new())));
        (
            AdminView::new(accounts.clone(), registry.clone(), bridge),
            accounts,
            registry,
        )
    }

    #[tokio::test]
    async fn test_empty_renderings() {
        let (view, _, _) = view();
        assert_eq!(view.render_accounts().await, "No accounts\n");
        assert_eq!(view.render_calls().await, "No active calls\n");
        assert_eq!(view.render_registrations().await, "No online devices\n");
    }

    #[tokio::test]
    async fn test_accounts_and_registrations() {
        let (view, accounts, registry) = view();
        accounts.add_account("200", "b").await;
        accounts.add_account("100", "a").await;

        let aor = SipUri::parse("sip:100@example.com").unwrap();
        for port in [5062, 5061] {
            registry
                .add_or_update(
                    &aor,
                    ContactInstance::new(
                        "sip:100@10.0.0.1",
                        3600,
                        format!("10.0.0.1:{}", port).parse().unwrap(),
                        "Phone",
                        "udp",
                    ),
                )
                .await;
        }

        let summaries = view.account_summaries().await;
        assert_eq!(summaries[0].username, "100");
        assert!(view.render_accounts().await.contains("100 \t\t a"));

        let registrations = view.registrations().await;
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].aor, "sip:100@example.com");
        assert_eq!(registrations[0].instances[0].source.port(), 5061);

        let text = view.render_registrations().await;
        assert!(text.starts_with("AOR: sip:100@example.com:\n"));
        assert!(text.contains("\tPhone, expires: 3600, source: 10.0.0.1:5061, transport: udp\n"));
    }
}
