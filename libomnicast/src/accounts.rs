//! Account registry
//!
//! Accounts are owned by users elsewhere; the orchestrator only needs to look
//! them up by id. [`StaticAccounts`] serves the `[[accounts]]` entries from the
//! configuration file and can be extended at runtime.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::error::{OmnicastError, Result};
use crate::types::{Account, Destination};

#[async_trait]
pub trait AccountRegistry: Send + Sync {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;
}

/// In-memory registry. Thread-safe via `Arc<RwLock<..>>`.
#[derive(Clone, Default)]
pub struct StaticAccounts {
    accounts: Arc<RwLock<HashMap<String, Account>>>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Self::new();
        for entry in &config.accounts {
            registry.register(entry.to_account()?)?;
        }
        Ok(registry)
    }

    /// Add or replace an account
    pub fn register(&self, account: Account) -> Result<()> {
        if account.id.trim().is_empty() {
            return Err(OmnicastError::InvalidInput("account id cannot be empty".to_string()));
        }
        if account.owner_id.trim().is_empty() {
            return Err(OmnicastError::InvalidInput(format!(
                "account {} has no owner",
                account.id
            )));
        }

        let mut accounts = self.write()?;
        accounts.insert(account.id.clone(), account);
        Ok(())
    }

    pub fn unregister(&self, account_id: &str) -> Result<bool> {
        Ok(self.write()?.remove(account_id).is_some())
    }

    pub fn list(&self, destination: Option<Destination>) -> Result<Vec<Account>> {
        let accounts = self
            .accounts
            .read()
            .map_err(|e| OmnicastError::InvalidInput(format!("account registry poisoned: {}", e)))?;
        let mut list: Vec<Account> = accounts
            .values()
            .filter(|a| destination.map_or(true, |d| a.destination == d))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Account>>> {
        self.accounts
            .write()
            .map_err(|e| OmnicastError::InvalidInput(format!("account registry poisoned: {}", e)))
    }
}

#[async_trait]
impl AccountRegistry for StaticAccounts {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let accounts = self
            .accounts
            .read()
            .map_err(|e| OmnicastError::InvalidInput(format!("account registry poisoned: {}", e)))?;
        Ok(accounts.get(account_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountConfig;

    fn account(id: &str, destination: Destination) -> Account {
        Account {
            id: id.to_string(),
            owner_id: "user-1".to_string(),
            destination,
            destination_uid: format!("uid-{}", id),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = StaticAccounts::new();
        registry.register(account("a", Destination::Tiktok)).unwrap();

        let found = registry.get_account("a").await.unwrap().unwrap();
        assert_eq!(found.destination, Destination::Tiktok);
        assert!(registry.get_account("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_rejects_missing_owner() {
        let registry = StaticAccounts::new();
        let mut orphan = account("a", Destination::Tiktok);
        orphan.owner_id = " ".to_string();
        assert!(registry.register(orphan).is_err());
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut config = Config::default_config();
        config.accounts.push(AccountConfig {
            id: "acc-1".to_string(),
            owner_id: "user-1".to_string(),
            destination: "instagram".to_string(),
            destination_uid: "1784".to_string(),
        });

        let registry = StaticAccounts::from_config(&config).unwrap();
        let listed = registry.list(Some(Destination::Instagram)).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(registry.list(Some(Destination::Youtube)).unwrap().is_empty());
        assert!(registry.unregister("acc-1").unwrap());
        assert!(!registry.unregister("acc-1").unwrap());
    }
}
