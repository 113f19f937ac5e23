//! Persisted record of the last verification result per model id.
//!
//! The ledger lives directly under the store root and is rewritten as a whole
//! through a temp file + rename, so readers only ever see a complete document.
//! A missing or unreadable ledger simply means nothing is trusted yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};
use crate::status::ModelStatus;
use crate::verify::Fingerprint;

pub const LEDGER_FILE_NAME: &str = ".modelpack-ledger.json";
const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub model_id: String,
    /// Manifest digest this entry was verified against.
    pub expected_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_hash: Option<String>,
    pub observed_size: u64,
    pub observed_mtime: DateTime<Utc>,
    pub status: ModelStatus,
    pub verified_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Whether the cached status can be reused for a file with `current`
    /// fingerprint, checked against a manifest expecting `expected_hash`.
    pub fn still_applies(&self, expected_hash: &str, current: &Fingerprint) -> bool {
        self.expected_hash == expected_hash
            && self.observed_size == current.size
            && self.observed_mtime == current.mtime
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, LedgerEntry>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

impl Ledger {
    /// Read the ledger under `store_root`.
    pub fn load(store_root: &Path) -> Result<Self> {
        let path = store_root.join(LEDGER_FILE_NAME);
        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => match serde_json::from_slice::<LedgerFile>(&bytes) {
                Ok(file) => file.entries,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "ignoring unreadable ledger, models will be re-verified"
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(ProvisionError::store_io("read ledger", &path, err)),
        };
        Ok(Self { path, entries })
    }

    pub fn get(&self, model_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(model_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Insert or replace an entry. Returns whether anything changed.
    pub fn upsert(&mut self, entry: LedgerEntry) -> bool {
        if self.entries.get(&entry.model_id) == Some(&entry) {
            return false;
        }
        self.entries.insert(entry.model_id.clone(), entry);
        true
    }

    /// Returns whether an entry was removed.
    pub fn remove(&mut self, model_id: &str) -> bool {
        self.entries.remove(model_id).is_some()
    }

    /// Atomically rewrite the ledger file.
    pub fn save(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| ProvisionError::store_io("locate", &self.path, io::ErrorKind::NotFound.into()))?;
        let document = LedgerFile {
            version: LEDGER_VERSION,
            entries: self.entries.clone(),
        };
        let content = serde_json::to_vec_pretty(&document).map_err(|err| {
            ProvisionError::store_io("encode ledger", &self.path, io::Error::new(io::ErrorKind::InvalidData, err))
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".modelpack-ledger")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|err| ProvisionError::store_io("create temp ledger in", dir, err))?;
        tmp.write_all(&content)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| ProvisionError::store_io("write", tmp.path(), err))?;
        tmp.persist(&self.path)
            .map_err(|err| ProvisionError::store_io("replace ledger", &self.path, err.error))?;
        tracing::debug!(path = %self.path.display(), entries = self.entries.len(), "ledger saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: &str, status: ModelStatus) -> LedgerEntry {
        LedgerEntry {
            model_id: id.into(),
            expected_hash: "aa".repeat(32),
            observed_hash: Some("aa".repeat(32)),
            observed_size: 42,
            observed_mtime: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + chrono::Duration::nanoseconds(123_456_789),
            status,
            verified_at: Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap(),
        }
    }

    #[test]
    fn absent_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::load(dir.path()).unwrap();
        assert_eq!(ledger.entries().count(), 0);
    }

    #[test]
    fn empty_or_garbage_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LEDGER_FILE_NAME), b"").unwrap();
        assert_eq!(Ledger::load(dir.path()).unwrap().entries().count(), 0);

        fs::write(dir.path().join(LEDGER_FILE_NAME), b"{\"entries\": [tru").unwrap();
        assert_eq!(Ledger::load(dir.path()).unwrap().entries().count(), 0);
    }

    #[test]
    fn save_then_load_preserves_entries_with_nanosecond_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();
        assert!(ledger.upsert(entry("m1", ModelStatus::Installed)));
        assert!(ledger.upsert(entry("m2", ModelStatus::Corrupt)));
        ledger.save().unwrap();

        let reloaded = Ledger::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("m1"), Some(&entry("m1", ModelStatus::Installed)));
        assert_eq!(reloaded.get("m2").unwrap().status, ModelStatus::Corrupt);

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != LEDGER_FILE_NAME)
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn upsert_reports_unchanged_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();
        assert!(ledger.upsert(entry("m1", ModelStatus::Installed)));
        assert!(!ledger.upsert(entry("m1", ModelStatus::Installed)));
        assert!(ledger.upsert(entry("m1", ModelStatus::Corrupt)));
        assert!(ledger.remove("m1"));
        assert!(!ledger.remove("m1"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{
            "version": 7,
            "written_by": "a newer build",
            "entries": {
                "m1": {
                    "model_id": "m1",
                    "expected_hash": "ab",
                    "observed_size": 3,
                    "observed_mtime": "2024-05-01T12:00:00Z",
                    "status": "installed",
                    "verified_at": "2024-05-01T12:00:01Z",
                    "signature": "future field"
                }
            }
        }"#;
        fs::write(dir.path().join(LEDGER_FILE_NAME), json).unwrap();
        let ledger = Ledger::load(dir.path()).unwrap();
        let m1 = ledger.get("m1").unwrap();
        assert_eq!(m1.status, ModelStatus::Installed);
        assert_eq!(m1.observed_hash, None);
    }

    #[test]
    fn cached_entry_applies_only_to_same_fingerprint_and_manifest_hash() {
        let e = entry("m1", ModelStatus::Installed);
        let same = Fingerprint {
            size: e.observed_size,
            mtime: e.observed_mtime,
        };
        assert!(e.still_applies(&e.expected_hash, &same));
        assert!(!e.still_applies(&"bb".repeat(32), &same));
        assert!(!e.still_applies(
            &e.expected_hash,
            &Fingerprint {
                size: 43,
                mtime: e.observed_mtime
            }
        ));
        assert!(!e.still_applies(
            &e.expected_hash,
            &Fingerprint {
                size: e.observed_size,
                mtime: e.observed_mtime + chrono::Duration::seconds(1),
            }
        ));
    }
}
