//! YAML file backend for the atom ledger.
//!
//! Layout:
//!
//! ```yaml
//! version: 1
//! atoms:
//!   - atom_id: run-a:confusion_point:1
//!     status: ticketed
//!     ticket_ids: [TKT-0123456789abcdef]
//! ```
//!
//! Entries are written sorted by `atom_id`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::LedgerError;
use crate::storage_traits::{AtomLedger, LedgerEntry, LedgerResult, LedgerSnapshot};
use crate::LEDGER_VERSION;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    version: u32,
    #[serde(default)]
    atoms: Option<Vec<LedgerEntry>>,
}

/// File-backed [`AtomLedger`].
///
/// Updates from one process are serialized through an async mutex and
/// persisted with a temp-file + rename, so readers never see a torn file.
#[derive(Debug)]
pub struct YamlAtomLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl YamlAtomLedger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_snapshot(&self) -> LedgerResult<LedgerSnapshot> {
        if !self.path.exists() {
            return Ok(LedgerSnapshot::new());
        }
        let text = fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(LedgerSnapshot::new());
        }
        let doc: LedgerDocument =
            serde_yaml::from_str(&text).map_err(|e| LedgerError::InvalidDocument {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if doc.version != LEDGER_VERSION {
            return Err(LedgerError::UnsupportedVersion {
                path: self.path.clone(),
                found: doc.version,
            });
        }

        let mut snapshot = LedgerSnapshot::new();
        for (idx, mut entry) in doc.atoms.unwrap_or_default().into_iter().enumerate() {
            let atom_id = entry.atom_id.trim().to_string();
            if atom_id.is_empty() {
                return Err(LedgerError::InvalidDocument {
                    path: self.path.clone(),
                    reason: format!("entry #{} is missing atom_id", idx + 1),
                });
            }
            entry.atom_id = atom_id.clone();
            snapshot.insert(atom_id, entry);
        }
        Ok(snapshot)
    }

    fn write_snapshot(&self, snapshot: &LedgerSnapshot) -> LedgerResult<()> {
        let atoms = snapshot
            .iter()
            .map(|(atom_id, entry)| {
                let mut entry = entry.clone();
                entry.atom_id = atom_id.clone();
                entry.normalize();
                entry
            })
            .collect();
        let doc = LedgerDocument {
            version: LEDGER_VERSION,
            atoms: Some(atoms),
        };
        let text = serde_yaml::to_string(&doc)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl AtomLedger for YamlAtomLedger {
    async fn load(&self) -> LedgerResult<LedgerSnapshot> {
        self.read_snapshot()
    }

    async fn update(
        &self,
        mutate: &mut (dyn for<'s> FnMut(&'s mut LedgerSnapshot) -> LedgerResult<()> + Send),
    ) -> LedgerResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.read_snapshot()?;
        mutate(&mut snapshot)?;
        self.write_snapshot(&snapshot)?;
        debug!(path = %self.path.display(), atoms = snapshot.len(), "atom ledger written");
        Ok(())
    }
}
