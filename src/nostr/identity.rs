//! Per-agent identity registry.
//!
//! A small JSON file under the workspace settings directory mapping actor
//! addresses to their provisioned keys and signer endpoints. The file holds
//! key references, so it is written mode 0600. Reads and writes go through
//! an in-memory map behind a read/write lock.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registry file location relative to the workspace root.
pub const REGISTRY_RELATIVE_PATH: &str = "settings/identity-registry.json";

/// Errors from registry persistence.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("registry I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One provisioned identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub pubkey: String,
    /// Signer service the identity relays through.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bunker: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default)]
    pub provisioned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rig: String,
}

/// Actor → identity map persisted to the settings directory.
pub struct IdentityRegistry {
    path: PathBuf,
    entries: RwLock<HashMap<String, IdentityRecord>>,
}

impl IdentityRegistry {
    /// Load the registry under the workspace root, starting empty when the
    /// file does not exist yet.
    pub fn load(root: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = root.as_ref().join(REGISTRY_RELATIVE_PATH);

        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Look up an identity by actor address.
    pub fn get(&self, actor: &str) -> Option<IdentityRecord> {
        self.entries.read().unwrap().get(actor).cloned()
    }

    /// Insert or replace an identity and persist the registry.
    pub fn upsert(&self, actor: impl Into<String>, record: IdentityRecord) -> Result<(), IdentityError> {
        {
            let mut entries = self.entries.write().unwrap();
            entries.insert(actor.into(), record);
        }
        self.save()
    }

    /// Remove an identity and persist. Returns the removed record.
    pub fn remove(&self, actor: &str) -> Result<Option<IdentityRecord>, IdentityError> {
        let removed = self.entries.write().unwrap().remove(actor);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// All identities, sorted by actor address.
    pub fn list(&self) -> Vec<(String, IdentityRecord)> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn save(&self) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = {
            let entries = self.entries.read().unwrap();
            serde_json::to_string_pretty(&*entries)?
        };

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp_path)?;
            file.write_all(json.as_bytes())?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
