use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{ProvisionError, Result};
use crate::ledger::{Ledger, LedgerEntry};
use crate::manifest::{ModelDescriptor, ModelPackManifest};
use crate::status::ModelStatus;
use crate::verify::{self, Observation};

/// Status of one model as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelState {
    pub model_id: String,
    pub status: ModelStatus,
}

/// Per-model statuses in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StatusReport(Vec<ModelState>);

impl StatusReport {
    pub fn get(&self, model_id: &str) -> Option<ModelStatus> {
        self.0
            .iter()
            .find(|state| state.model_id == model_id)
            .map(|state| state.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelState> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn all_installed(&self) -> bool {
        self.0.iter().all(|state| state.status.is_installed())
    }
}

impl FromIterator<ModelState> for StatusReport {
    fn from_iter<I: IntoIterator<Item = ModelState>>(iter: I) -> Self {
        StatusReport(iter.into_iter().collect())
    }
}

/// Ledger-backed view of which models are usable in one store.
///
/// The ledger mutex doubles as the store lock: `check` and pack promotion both
/// hold it for their whole duration, so a check observes a store either
/// before or after a promotion, never half way.
#[derive(Debug)]
pub struct StatusRegistry {
    root: PathBuf,
    manifest: ModelPackManifest,
    ledger: Mutex<Ledger>,
    in_flight: Mutex<HashMap<String, ModelStatus>>,
}

impl StatusRegistry {
    /// Open the store at `root`, creating the directory on first use.
    pub fn open(root: impl Into<PathBuf>, manifest: ModelPackManifest) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| ProvisionError::store_io("create", &root, err))?;
        let root = fs::canonicalize(&root).map_err(|err| ProvisionError::store_io("resolve", &root, err))?;
        let ledger = Ledger::load(&root)?;
        Ok(Self {
            root,
            manifest,
            ledger: Mutex::new(ledger),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &ModelPackManifest {
        &self.manifest
    }

    /// Reconcile the ledger with the files on disk and report each model.
    ///
    /// Unchanged files are answered from the ledger; anything new, touched, or
    /// verified against another manifest is hashed again. Model files are never
    /// modified.
    pub fn check(&self, ids: Option<&[String]>) -> Result<StatusReport> {
        let models = self.manifest.select(ids)?;
        let mut ledger = self.lock_ledger();
        let before = ledger.clone();
        let mut dirty = false;
        let mut states = Vec::with_capacity(models.len());

        for model in models {
            let (status, changed) = self.reconcile(&mut ledger, model)?;
            dirty |= changed;
            states.push(ModelState {
                model_id: model.id.clone(),
                status,
            });
        }

        if dirty {
            if let Err(err) = ledger.save() {
                // Keep memory in line with disk so the next check retries the write.
                *ledger = before;
                return Err(err);
            }
        }
        Ok(StatusReport(states))
    }

    /// Like [`check`](Self::check), with in-flight download phases overlaid.
    pub fn snapshot(&self) -> Result<StatusReport> {
        let report = self.check(None)?;
        let in_flight = self.lock_in_flight();
        Ok(report
            .0
            .into_iter()
            .map(|state| match in_flight.get(&state.model_id) {
                Some(status) => ModelState {
                    model_id: state.model_id,
                    status: *status,
                },
                None => state,
            })
            .collect())
    }

    pub fn ledger_entry(&self, model_id: &str) -> Option<LedgerEntry> {
        self.lock_ledger().get(model_id).cloned()
    }

    /// Delete a model's files and forget it. Returns whether anything existed.
    pub fn remove(&self, model_id: &str) -> Result<bool> {
        let model = self
            .manifest
            .get(model_id)
            .ok_or_else(|| ProvisionError::Manifest(format!("unknown model id '{}'", model_id)))?;
        let path = model.path_in(&self.root);
        let mut ledger = self.lock_ledger();

        let removed = match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => {
                fs::remove_dir_all(&path).map_err(|err| ProvisionError::store_io("remove", &path, err))?;
                true
            }
            Ok(_) => {
                fs::remove_file(&path).map_err(|err| ProvisionError::store_io("remove", &path, err))?;
                true
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return Err(ProvisionError::store_io("inspect", &path, err)),
        };

        if ledger.remove(model_id) {
            ledger.save()?;
        }
        tracing::info!(model = model_id, removed, "model removed");
        Ok(removed)
    }

    /// Run `f` with the store lock held.
    pub(crate) fn with_store_lock<R>(&self, f: impl FnOnce(&mut Ledger) -> Result<R>) -> Result<R> {
        let mut ledger = self.lock_ledger();
        f(&mut ledger)
    }

    pub(crate) fn set_in_flight(&self, status: ModelStatus) {
        let mut in_flight = self.lock_in_flight();
        for id in self.manifest.ids() {
            in_flight.insert(id.to_string(), status);
        }
    }

    pub(crate) fn clear_in_flight(&self) {
        self.lock_in_flight().clear();
    }

    fn reconcile(&self, ledger: &mut Ledger, model: &ModelDescriptor) -> Result<(ModelStatus, bool)> {
        let path = model.path_in(&self.root);
        let Some(current) = verify::fingerprint(&path)? else {
            return Ok((ModelStatus::Missing, ledger.remove(&model.id)));
        };

        if let Some(entry) = ledger.get(&model.id) {
            if entry.still_applies(&model.expected_hash, &current) {
                return Ok((entry.status, false));
            }
            tracing::debug!(model = %model.id, "ledger entry is stale, re-verifying");
        }

        tracing::info!(model = %model.id, path = %path.display(), "verifying model");
        let verification = verify::verify(&path, &model.expected_hash, model.expected_size)?;
        match verification.observation {
            Some(observation) => {
                let entry = ledger_entry(model, &observation, verification.status);
                Ok((verification.status, ledger.upsert(entry)))
            }
            None => Ok((ModelStatus::Missing, ledger.remove(&model.id))),
        }
    }

    fn lock_ledger(&self) -> MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, ModelStatus>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub(crate) fn ledger_entry(
    model: &ModelDescriptor,
    observation: &Observation,
    status: ModelStatus,
) -> LedgerEntry {
    LedgerEntry {
        model_id: model.id.clone(),
        expected_hash: model.expected_hash.clone(),
        observed_hash: observation.hash.clone(),
        observed_size: observation.fingerprint.size,
        observed_mtime: observation.fingerprint.mtime,
        status,
        verified_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LEDGER_FILE_NAME;
    use sha2::{Digest, Sha256};

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    fn manifest_for(models: &[(&str, &str, &[u8])]) -> ModelPackManifest {
        ModelPackManifest {
            pack_url: "https://example.invalid/ModelPack.zip".into(),
            pack_hash: None,
            models: models
                .iter()
                .map(|(id, path, content)| ModelDescriptor {
                    id: id.to_string(),
                    display_name: String::new(),
                    relative_path: PathBuf::from(path),
                    expected_hash: sha256_hex(content),
                    expected_size: content.len() as u64,
                })
                .collect(),
        }
        .validated()
        .unwrap()
    }

    #[test]
    fn empty_store_reports_missing_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::open(dir.path(), manifest_for(&[("m1", "m1.bin", b"one")])).unwrap();
        let report = registry.check(None).unwrap();
        assert_eq!(report.get("m1"), Some(ModelStatus::Missing));
        assert!(!dir.path().join(LEDGER_FILE_NAME).exists());
    }

    #[test]
    fn installed_then_corrupt_after_external_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::open(dir.path(), manifest_for(&[("m1", "m1.bin", b"one")])).unwrap();
        fs::write(dir.path().join("m1.bin"), b"one").unwrap();
        assert_eq!(registry.check(None).unwrap().get("m1"), Some(ModelStatus::Installed));
        assert_eq!(
            registry.ledger_entry("m1").unwrap().observed_hash.as_deref(),
            Some(sha256_hex(b"one").as_str())
        );

        fs::write(dir.path().join("m1.bin"), b"two!").unwrap();
        assert_eq!(registry.check(None).unwrap().get("m1"), Some(ModelStatus::Corrupt));
    }

    #[test]
    fn repeated_check_is_idempotent_and_does_not_rewrite_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::open(
            dir.path(),
            manifest_for(&[("m1", "m1.bin", b"one"), ("m2", "m2.bin", b"two")]),
        )
        .unwrap();
        fs::write(dir.path().join("m1.bin"), b"one").unwrap();
        fs::write(dir.path().join("m2.bin"), b"not two").unwrap();

        let first = registry.check(None).unwrap();
        let ledger_path = dir.path().join(LEDGER_FILE_NAME);
        let ledger_before = fs::read(&ledger_path).unwrap();
        let modified_before = fs::metadata(&ledger_path).unwrap().modified().unwrap();

        let second = registry.check(None).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(&ledger_path).unwrap(), ledger_before);
        assert_eq!(fs::metadata(&ledger_path).unwrap().modified().unwrap(), modified_before);
        assert_eq!(fs::read(dir.path().join("m1.bin")).unwrap(), b"one");
        assert_eq!(fs::read(dir.path().join("m2.bin")).unwrap(), b"not two");
    }

    #[test]
    fn unchanged_files_are_answered_from_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_for(&[("m1", "m1.bin", b"one")]);
        fs::write(dir.path().join("m1.bin"), b"one").unwrap();
        let fp = verify::fingerprint(&dir.path().join("m1.bin")).unwrap().unwrap();

        // A ledger claiming corruption for the exact current fingerprint is trusted.
        let mut ledger = Ledger::load(dir.path()).unwrap();
        ledger.upsert(ledger_entry(
            &manifest.models[0],
            &Observation {
                fingerprint: fp,
                hash: None,
            },
            ModelStatus::Corrupt,
        ));
        ledger.save().unwrap();

        let registry = StatusRegistry::open(dir.path(), manifest).unwrap();
        assert_eq!(registry.check(None).unwrap().get("m1"), Some(ModelStatus::Corrupt));
    }

    #[test]
    fn entry_verified_against_an_older_manifest_is_rechecked() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("m1.bin"), b"old release").unwrap();
        let old = manifest_for(&[("m1", "m1.bin", b"old release")]);
        let registry = StatusRegistry::open(dir.path(), old).unwrap();
        assert_eq!(registry.check(None).unwrap().get("m1"), Some(ModelStatus::Installed));
        drop(registry);

        let new = manifest_for(&[("m1", "m1.bin", b"new release")]);
        let registry = StatusRegistry::open(dir.path(), new).unwrap();
        assert_eq!(registry.check(None).unwrap().get("m1"), Some(ModelStatus::Corrupt));
    }

    #[test]
    fn migrated_store_without_ledger_verifies_installed() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_for(&[("m1", "m1.bin", b"one"), ("tree", "cellpose", b"")]);
        let old_root = dir.path().join("machine-a");
        fs::create_dir_all(old_root.join("cellpose/nuclei")).unwrap();
        fs::write(old_root.join("m1.bin"), b"one").unwrap();
        fs::write(old_root.join("cellpose/nuclei/w.pt"), b"weights").unwrap();

        let tree_hash = verify::hash_path(&old_root.join("cellpose")).unwrap();
        let mut manifest = manifest;
        manifest.models[1].expected_hash = tree_hash;
        manifest.models[1].expected_size = 7;

        let registry = StatusRegistry::open(&old_root, manifest.clone()).unwrap();
        assert!(registry.check(None).unwrap().all_installed());
        drop(registry);

        let new_root = dir.path().join("machine-b");
        copy_tree(&old_root, &new_root);
        fs::remove_file(new_root.join(LEDGER_FILE_NAME)).unwrap();

        let registry = StatusRegistry::open(&new_root, manifest).unwrap();
        let report = registry.check(None).unwrap();
        assert_eq!(report.len(), 2);
        assert!(report.all_installed(), "{report:?}");
    }

    fn copy_tree(from: &Path, to: &Path) {
        for entry in walkdir::WalkDir::new(from) {
            let entry = entry.unwrap();
            let target = to.join(entry.path().strip_prefix(from).unwrap());
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).unwrap();
            } else {
                fs::copy(entry.path(), &target).unwrap();
            }
        }
    }

    #[test]
    fn unwritable_ledger_is_reported_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::open(dir.path(), manifest_for(&[("m1", "m1.bin", b"one")])).unwrap();
        fs::write(dir.path().join("m1.bin"), b"one").unwrap();
        let ledger_path = dir.path().join(LEDGER_FILE_NAME);
        fs::create_dir(&ledger_path).unwrap();
        fs::write(ledger_path.join("occupied"), b"x").unwrap();

        let err = registry.check(None).unwrap_err();
        assert_eq!(err.kind(), "store-io");
        assert!(registry.ledger_entry("m1").is_none());

        fs::remove_dir_all(&ledger_path).unwrap();
        assert_eq!(registry.check(None).unwrap().get("m1"), Some(ModelStatus::Installed));
        assert!(ledger_path.is_file());
    }

    #[test]
    fn removed_files_drop_their_ledger_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::open(dir.path(), manifest_for(&[("m1", "m1.bin", b"one")])).unwrap();
        fs::write(dir.path().join("m1.bin"), b"one").unwrap();
        registry.check(None).unwrap();
        assert!(registry.ledger_entry("m1").is_some());

        fs::remove_file(dir.path().join("m1.bin")).unwrap();
        assert_eq!(registry.check(None).unwrap().get("m1"), Some(ModelStatus::Missing));
        assert!(registry.ledger_entry("m1").is_none());
    }

    #[test]
    fn remove_deletes_files_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            StatusRegistry::open(dir.path(), manifest_for(&[("tree", "sam", b"")])).unwrap();
        fs::create_dir_all(dir.path().join("sam")).unwrap();
        fs::write(dir.path().join("sam/ckpt.pth"), b"x").unwrap();
        registry.check(None).unwrap();

        assert!(registry.remove("tree").unwrap());
        assert!(!dir.path().join("sam").exists());
        assert!(registry.ledger_entry("tree").is_none());
        assert!(!registry.remove("tree").unwrap());
        assert!(registry.remove("unknown").is_err());
    }

    #[test]
    fn check_subset_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::open(
            dir.path(),
            manifest_for(&[("m1", "m1.bin", b"one"), ("m2", "m2.bin", b"two")]),
        )
        .unwrap();
        let report = registry.check(Some(&["m2".to_string()])).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report.get("m2"), Some(ModelStatus::Missing));
        assert!(registry.check(Some(&["m3".to_string()])).is_err());
    }

    #[test]
    fn snapshot_overlays_in_flight_phase() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::open(dir.path(), manifest_for(&[("m1", "m1.bin", b"one")])).unwrap();
        registry.set_in_flight(ModelStatus::Downloading);
        assert_eq!(registry.snapshot().unwrap().get("m1"), Some(ModelStatus::Downloading));
        assert_eq!(registry.check(None).unwrap().get("m1"), Some(ModelStatus::Missing));
        registry.clear_in_flight();
        assert_eq!(registry.snapshot().unwrap().get("m1"), Some(ModelStatus::Missing));
    }
}
