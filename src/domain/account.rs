//! SIP accounts used for inbound digest authentication

use crate::domain::shared::{DomainError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Credential lookup consulted by the authentication layer
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Secret of `username`, or `AuthenticationFailure` when unknown
    async fn lookup_secret(&self, username: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
}

/// Username to secret table, static apart from explicit additions
pub struct AccountTable {
    accounts: RwLock<HashMap<String, String>>,
}

impl AccountTable {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_account(&self, username: &str, password: &str) {
        let mut accounts = self.accounts.write().await;
        accounts.insert(username.to_string(), password.to_string());
        info!("Added account: {}", username);
    }

    /// Sorted snapshot of all accounts
    pub async fn accounts(&self) -> Vec<Account> {
        let accounts = self.accounts.read().await;
        let mut list: Vec<Account> = accounts
            .iter()
            .map(|(username, password)| Account {
                username: username.clone(),
                password: password.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.username.cmp(&b.username));
        list
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }
}

impl Default for AccountTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for AccountTable {
    async fn lookup_secret(&self, username: &str) -> Result<String> {
        let accounts = self.accounts.read().await;
        match accounts.get(username) {
            Some(secret) => {
                debug!("Found user {}", username);
                Ok(secret.clone())
            }
            None => Err(DomainError::AuthenticationFailure(format!(
                "username [{}] not found",
                username
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_secret() {
        let table = AccountTable::new();
        table.add_account("100", "secret").await;

        assert_eq!(table.lookup_secret("100").await.unwrap(), "secret");
        assert!(matches!(
            table.lookup_secret("999").await,
            Err(DomainError::AuthenticationFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_accounts_sorted() {
        let table = AccountTable::new();
        table.add_account("200", "b").await;
        table.add_account("100", "a").await;
        table.add_account("100", "c").await;

        let accounts = table.accounts().await;
        assert_eq!(table.len().await, 2);
        assert_eq!(accounts[0].username, "100");
        assert_eq!(accounts[0].password, "c");
        assert_eq!(accounts[1].username, "200");
    }
}
