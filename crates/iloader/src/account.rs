//! Signed-in Apple accounts.
//!
//! Metadata (identifier, creation time, which account is active) lives in
//! `accounts.json`. Session tokens go to the [`SecretVault`] and never into
//! the metadata file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::SessionToken;
use crate::vault::{write_private, SecretKind, SecretVault};
use crate::{Error, Result};

pub const ACCOUNTS_FILE: &str = "accounts.json";

/// An Apple ID that completed sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub identifier: String,
    pub session_token: SessionToken,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(identifier: impl Into<String>, session_token: SessionToken) -> Self {
        Self {
            identifier: identifier.into(),
            session_token,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountRecord {
    identifier: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    #[serde(default)]
    active: Option<String>,
    #[serde(default)]
    accounts: Vec<AccountRecord>,
}

/// Accounts with at most one marked active.
pub struct AccountStore {
    path: Option<PathBuf>,
    vault: Arc<SecretVault>,
    metadata: Mutex<Metadata>,
}

impl AccountStore {
    /// Load `accounts.json` from `dir`; tokens come from `vault`.
    pub fn open(dir: impl AsRef<Path>, vault: Arc<SecretVault>) -> Result<Self> {
        let path = dir.as_ref().join(ACCOUNTS_FILE);
        let metadata = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Config(format!("accounts file is corrupt: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Metadata::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "opened account store");
        Ok(Self {
            path: Some(path),
            vault,
            metadata: Mutex::new(metadata),
        })
    }

    /// Store backed by memory only, with its own in-memory vault.
    pub fn in_memory() -> Self {
        Self::detached(Arc::new(SecretVault::in_memory()))
    }

    /// Metadata kept in memory; tokens still go to `vault`.
    pub fn detached(vault: Arc<SecretVault>) -> Self {
        Self {
            path: None,
            vault,
            metadata: Mutex::new(Metadata::default()),
        }
    }

    pub fn vault(&self) -> &Arc<SecretVault> {
        &self.vault
    }

    /// Insert or replace `account` and make it active.
    ///
    /// Re-adding an identifier replaces its token and keeps one entry.
    pub fn add(&self, account: Account) -> Result<()> {
        let mut metadata = self.metadata.lock();
        self.vault.put(
            &account.identifier,
            &SecretKind::SessionToken,
            account.session_token.as_bytes(),
        )?;
        match metadata
            .accounts
            .iter_mut()
            .find(|r| r.identifier == account.identifier)
        {
            Some(record) => record.created_at = account.created_at,
            None => metadata.accounts.push(AccountRecord {
                identifier: account.identifier.clone(),
                created_at: account.created_at,
            }),
        }
        metadata.active = Some(account.identifier.clone());
        self.persist(&metadata)?;
        info!(identifier = %account.identifier, "account saved");
        Ok(())
    }

    /// Make `identifier` the active account.
    pub fn switch(&self, identifier: &str) -> Result<()> {
        let mut metadata = self.metadata.lock();
        if !metadata.accounts.iter().any(|r| r.identifier == identifier) {
            return Err(Error::UnknownAccount(identifier.to_string()));
        }
        metadata.active = Some(identifier.to_string());
        self.persist(&metadata)?;
        info!(identifier, "switched account");
        Ok(())
    }

    /// Forget `identifier` and every secret stored for it.
    ///
    /// When it was active the first remaining account becomes active.
    pub fn remove(&self, identifier: &str) -> Result<()> {
        let mut metadata = self.metadata.lock();
        let before = metadata.accounts.len();
        metadata.accounts.retain(|r| r.identifier != identifier);
        if metadata.accounts.len() == before {
            return Err(Error::UnknownAccount(identifier.to_string()));
        }
        if metadata.active.as_deref() == Some(identifier) {
            metadata.active = metadata.accounts.first().map(|r| r.identifier.clone());
        }
        self.vault.purge(identifier)?;
        self.persist(&metadata)?;
        info!(identifier, "account removed");
        Ok(())
    }

    /// Every stored account, in the order they were first added.
    ///
    /// Accounts whose token is missing from the vault are skipped.
    pub fn list(&self) -> Vec<Account> {
        let metadata = self.metadata.lock();
        metadata
            .accounts
            .iter()
            .filter_map(|record| self.hydrate(record))
            .collect()
    }

    pub fn active(&self) -> Option<Account> {
        let metadata = self.metadata.lock();
        let active = metadata.active.as_deref()?;
        metadata
            .accounts
            .iter()
            .find(|r| r.identifier == active)
            .and_then(|record| self.hydrate(record))
    }

    pub fn get(&self, identifier: &str) -> Option<Account> {
        let metadata = self.metadata.lock();
        metadata
            .accounts
            .iter()
            .find(|r| r.identifier == identifier)
            .and_then(|record| self.hydrate(record))
    }

    fn hydrate(&self, record: &AccountRecord) -> Option<Account> {
        let token = self.vault.get(&record.identifier, &SecretKind::SessionToken)?;
        Some(Account {
            identifier: record.identifier.clone(),
            session_token: SessionToken::new(token.as_slice()),
            created_at: record.created_at,
        })
    }

    fn persist(&self, metadata: &Metadata) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| Error::Config(format!("failed to encode accounts: {e}")))?;
        write_private(path, &json)
    }
}
