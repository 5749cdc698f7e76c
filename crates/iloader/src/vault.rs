//! Secret storage kept apart from account metadata.
//!
//! Entries are byte strings under `<account>/<kind>` keys. The file backing
//! writes `vault.json` (base64 values) through a temporary file and, on
//! unix, restricts it to the owner.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{Error, Result};

pub const VAULT_FILE: &str = "vault.json";

/// Kinds of secret held per account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretKind {
    SessionToken,
    Password,
    /// PKCS#8 key for the certificate with this serial number
    CertificateKey(String),
}

impl SecretKind {
    fn key(&self, account: &str) -> String {
        match self {
            SecretKind::SessionToken => format!("{account}/token"),
            SecretKind::Password => format!("{account}/password"),
            SecretKind::CertificateKey(serial) => format!("{account}/key/{serial}"),
        }
    }
}

/// Secret store for tokens, passwords and private keys.
pub struct SecretVault {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, Zeroizing<Vec<u8>>>>,
}

impl fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretVault")
            .field("path", &self.path)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl SecretVault {
    /// Open or create `vault.json` in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(VAULT_FILE);
        let entries = match std::fs::read(&path) {
            Ok(bytes) => decode(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "opened secret vault");
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// Vault that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, account: &str, kind: &SecretKind) -> Option<Zeroizing<Vec<u8>>> {
        self.entries.lock().get(&kind.key(account)).cloned()
    }

    pub fn put(&self, account: &str, kind: &SecretKind, secret: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(kind.key(account), Zeroizing::new(secret.to_vec()));
        self.persist(&entries)
    }

    pub fn delete(&self, account: &str, kind: &SecretKind) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(&kind.key(account)).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    /// Remove every secret stored for `account`.
    pub fn purge(&self, account: &str) -> Result<()> {
        let prefix = format!("{account}/");
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&prefix));
        if entries.len() != before {
            debug!(account, removed = before - entries.len(), "purged secrets");
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn persist(&self, entries: &BTreeMap<String, Zeroizing<Vec<u8>>>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let encoded: BTreeMap<&str, String> = entries
            .iter()
            .map(|(k, v)| (k.as_str(), STANDARD.encode(v.as_slice())))
            .collect();
        let json = Zeroizing::new(
            serde_json::to_vec_pretty(&encoded)
                .map_err(|e| Error::Config(format!("failed to encode vault: {e}")))?,
        );
        write_private(path, &json)
    }
}

fn decode(bytes: &[u8]) -> Result<BTreeMap<String, Zeroizing<Vec<u8>>>> {
    let encoded: BTreeMap<String, String> = serde_json::from_slice(bytes)
        .map_err(|e| Error::Config(format!("vault file is corrupt: {e}")))?;
    encoded
        .into_iter()
        .map(|(key, value)| {
            STANDARD
                .decode(value)
                .map(|bytes| (key, Zeroizing::new(bytes)))
                .map_err(|e| Error::Config(format!("vault entry is corrupt: {e}")))
        })
        .collect()
}

/// Replace `path` with `contents`, readable only by the owner on unix.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::from(e.error))?;
    Ok(())
}
