//! Staged extraction of a model pack and promotion into the live store.
//!
//! Nothing reaches the store root until every declared model verified inside
//! the staging directory. Promotion then renames model subtrees one by one;
//! replaced content is set aside inside staging so a failed rename can be
//! rolled back, and is deleted together with staging afterwards.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use zip::ZipArchive;

use crate::error::{ModelFailure, ProvisionError, Result};
use crate::ledger::Ledger;
use crate::manifest::ModelDescriptor;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::{self, ModelState, StatusRegistry, StatusReport};
use crate::status::ModelStatus;
use crate::verify::{self, Observation};

const PACK_DIR: &str = "pack";
const REPLACED_DIR: &str = "replaced";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Sniff the format from the leading bytes of the file.
    pub fn detect(path: &Path) -> Result<Self> {
        let mut magic = [0u8; 4];
        let mut file = File::open(path).map_err(|err| ProvisionError::store_io("open", path, err))?;
        let read = read_prefix(&mut file, &mut magic)
            .map_err(|err| ProvisionError::store_io("read", path, err))?;
        match &magic[..read] {
            [b'P', b'K', 3, 4] | [b'P', b'K', 5, 6] => Ok(ArchiveFormat::Zip),
            [0x1f, 0x8b, ..] => Ok(ArchiveFormat::TarGz),
            _ => Err(ProvisionError::PackIntegrity(
                "not a recognized archive (expected ZIP or tar.gz)".into(),
            )),
        }
    }
}

/// Directory that holds download and staging files for `store_root`: its
/// parent, so renames into the store stay on one filesystem.
pub fn work_dir_for(store_root: &Path) -> PathBuf {
    store_root
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(store_root)
        .to_path_buf()
}

/// Extract `archive`, verify every declared model in staging, and promote
/// them into the registry's store. All models or none are installed.
pub fn extract_and_install(
    archive: &Path,
    registry: &StatusRegistry,
    progress: &ProgressSink,
) -> Result<StatusReport> {
    let root = registry.root();
    let work_dir = work_dir_for(root);
    let staging = tempfile::Builder::new()
        .prefix(".modelpack-staging-")
        .tempdir_in(&work_dir)
        .map_err(|err| ProvisionError::store_io("create staging directory in", &work_dir, err))?;
    let pack_dir = staging.path().join(PACK_DIR);
    fs::create_dir(&pack_dir).map_err(|err| ProvisionError::store_io("create", &pack_dir, err))?;

    progress.emit(ProgressEvent::Extracting);
    let format = ArchiveFormat::detect(archive)?;
    tracing::info!(?format, staging = %staging.path().display(), "extracting model pack");
    match format {
        ArchiveFormat::Zip => unpack_zip(archive, &pack_dir)?,
        ArchiveFormat::TarGz => unpack_tar_gz(archive, &pack_dir)?,
    }

    let models = &registry.manifest().models;
    let mut staged = Vec::with_capacity(models.len());
    let mut failures = Vec::new();
    for model in models {
        progress.emit(ProgressEvent::Verifying {
            model_id: model.id.clone(),
        });
        let verification = verify::verify_model(&pack_dir, model)?;
        match (verification.status, verification.observation) {
            (ModelStatus::Installed, Some(observation)) => staged.push(observation),
            (status, _) => {
                tracing::warn!(model = %model.id, %status, "model failed verification in staging");
                failures.push(ModelFailure {
                    model_id: model.id.clone(),
                    status,
                });
            }
        }
    }
    if !failures.is_empty() {
        return Err(ProvisionError::ModelIntegrity(failures));
    }

    progress.emit(ProgressEvent::Installing);
    registry.with_store_lock(|ledger| {
        let promoted = promote(&pack_dir, &staging.path().join(REPLACED_DIR), root, models)?;

        let before = ledger.clone();
        if let Err(err) = record_installed(ledger, root, models, &staged) {
            tracing::error!(error = %err, "could not record installed models, rolling back");
            *ledger = before;
            rollback(promoted);
            return Err(err);
        }
        Ok(())
    })?;

    let report: StatusReport = models
        .iter()
        .map(|model| ModelState {
            model_id: model.id.clone(),
            status: ModelStatus::Installed,
        })
        .collect();
    tracing::info!(models = report.len(), "model pack installed");
    progress.emit(ProgressEvent::Finished);
    Ok(report)
}

/// Ledger entries for freshly promoted models, persisted before returning.
fn record_installed(
    ledger: &mut Ledger,
    root: &Path,
    models: &[ModelDescriptor],
    staged: &[Observation],
) -> Result<()> {
    for (model, staged) in models.iter().zip(staged) {
        let live = model.path_in(root);
        let fingerprint = verify::fingerprint(&live)?.unwrap_or(staged.fingerprint);
        let observation = Observation {
            fingerprint,
            hash: staged.hash.clone(),
        };
        ledger.upsert(registry::ledger_entry(model, &observation, ModelStatus::Installed));
    }
    ledger.save()
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Decoding problems mean a broken pack; anything else is the local disk.
fn extraction_error(path: &Path, err: io::Error) -> ProvisionError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof | io::ErrorKind::Other => {
            ProvisionError::PackIntegrity(format!("cannot extract {}: {}", path.display(), err))
        }
        _ => ProvisionError::store_io("extract", path, err),
    }
}

fn unpack_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|err| ProvisionError::store_io("open", archive, err))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|err| ProvisionError::PackIntegrity(format!("unreadable ZIP archive: {}", err)))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|err| ProvisionError::PackIntegrity(format!("unreadable ZIP entry: {}", err)))?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(ProvisionError::PackIntegrity(format!(
                "entry '{}' points outside the pack",
                entry.name()
            )));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| ProvisionError::store_io("create", &target, err))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| ProvisionError::store_io("create", parent, err))?;
        }
        let mut out = File::create(&target).map_err(|err| ProvisionError::store_io("create", &target, err))?;
        io::copy(&mut entry, &mut out).map_err(|err| extraction_error(&target, err))?;
        tracing::debug!(entry = %target.display(), "extracted");
    }
    Ok(())
}

fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|err| ProvisionError::store_io("open", archive, err))?;
    let mut tar = Archive::new(GzDecoder::new(file));
    let entries = tar.entries().map_err(|err| extraction_error(archive, err))?;

    for entry in entries {
        let mut entry = entry.map_err(|err| extraction_error(archive, err))?;
        let name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<invalid name>".into());
        let inside = entry.unpack_in(dest).map_err(|err| extraction_error(archive, err))?;
        if !inside {
            return Err(ProvisionError::PackIntegrity(format!(
                "entry '{}' points outside the pack",
                name
            )));
        }
        tracing::debug!(entry = %name, "extracted");
    }
    Ok(())
}

#[derive(Debug)]
enum SetAside {
    /// Old file still in place, a hard link kept in staging.
    Linked(PathBuf),
    /// Old content moved into staging.
    Moved(PathBuf),
}

#[derive(Debug)]
struct Promoted {
    live: PathBuf,
    previous: Option<SetAside>,
    /// Parent directories that did not exist before, deepest first.
    created: Vec<PathBuf>,
}

fn promote(
    pack_dir: &Path,
    replaced: &Path,
    root: &Path,
    models: &[ModelDescriptor],
) -> Result<Vec<Promoted>> {
    fs::create_dir_all(replaced).map_err(|err| ProvisionError::store_io("create", replaced, err))?;

    let mut done: Vec<Promoted> = Vec::with_capacity(models.len());
    for (i, model) in models.iter().enumerate() {
        let staged = model.path_in(pack_dir);
        let live = model.path_in(root);
        match promote_one(&staged, &live, &replaced.join(i.to_string())) {
            Ok(promoted) => {
                tracing::debug!(model = %model.id, path = %live.display(), "promoted");
                done.push(promoted);
            }
            Err(err) => {
                tracing::error!(model = %model.id, error = %err, "promotion failed, rolling back");
                rollback(done);
                return Err(err);
            }
        }
    }
    Ok(done)
}

/// Undo promotions in reverse order.
fn rollback(done: Vec<Promoted>) {
    for promoted in done.into_iter().rev() {
        restore(&promoted.live, promoted.previous.as_ref());
        remove_created(&promoted.created);
    }
}

fn promote_one(staged: &Path, live: &Path, backup: &Path) -> Result<Promoted> {
    let created = create_parents(live)?;
    match swap_in(staged, live, backup) {
        Ok(previous) => Ok(Promoted {
            live: live.to_path_buf(),
            previous,
            created,
        }),
        Err(err) => {
            remove_created(&created);
            Err(err)
        }
    }
}

/// Move `staged` to `live`, setting aside whatever was there.
fn swap_in(staged: &Path, live: &Path, backup: &Path) -> Result<Option<SetAside>> {
    let previous = match fs::symlink_metadata(live) {
        Ok(existing) => {
            let both_files = existing.is_file() && staged.is_file();
            if both_files && fs::hard_link(live, backup).is_ok() {
                Some(SetAside::Linked(backup.to_path_buf()))
            } else {
                fs::rename(live, backup).map_err(|err| ProvisionError::store_io("set aside", live, err))?;
                Some(SetAside::Moved(backup.to_path_buf()))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(ProvisionError::store_io("inspect", live, err)),
    };

    if let Err(err) = fs::rename(staged, live) {
        restore(live, previous.as_ref());
        return Err(ProvisionError::store_io("install", live, err));
    }
    Ok(previous)
}

/// Create the parents of `live`, returning the ones that were missing.
fn create_parents(live: &Path) -> Result<Vec<PathBuf>> {
    let Some(parent) = live.parent() else {
        return Ok(Vec::new());
    };
    let mut created = Vec::new();
    let mut dir = parent;
    while fs::symlink_metadata(dir).is_err() {
        created.push(dir.to_path_buf());
        match dir.parent() {
            Some(up) => dir = up,
            None => break,
        }
    }
    if let Err(err) = fs::create_dir_all(parent) {
        remove_created(&created);
        return Err(ProvisionError::store_io("create", parent, err));
    }
    Ok(created)
}

fn remove_created(dirs: &[PathBuf]) {
    for dir in dirs {
        if let Err(err) = fs::remove_dir(dir) {
            tracing::debug!(path = %dir.display(), error = %err, "left directory in place");
        }
    }
}

/// Put back what was at `live` before promotion.
fn restore(live: &Path, previous: Option<&SetAside>) {
    let result = match previous {
        Some(SetAside::Linked(backup)) => fs::rename(backup, live),
        Some(SetAside::Moved(backup)) => remove_path(live).and_then(|_| fs::rename(backup, live)),
        None => remove_path(live),
    };
    if let Err(err) = result {
        tracing::error!(path = %live.display(), error = %err, "failed to roll back model");
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
