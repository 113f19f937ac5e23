//! Content hashing and verification of installed model artifacts.
//!
//! A single file hashes to the plain SHA-256 of its bytes, so a digest can be
//! cross-checked with `sha256sum`. A directory hashes every regular file below
//! it in path order, framing each one with its relative path and length:
//!
//! ```text
//! for file in sorted(files):
//!     update(relative_path_with_forward_slashes)
//!     update(0x00)
//!     update(len as u64 little-endian)
//!     update(contents)
//! ```
//!
//! Only names relative to the model root and file contents feed the digest,
//! which keeps a store verifiable after it is copied to another machine.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::error::{ProvisionError, Result};
use crate::manifest::ModelDescriptor;
use crate::status::ModelStatus;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Cheap identity of a file or tree used to decide whether a cached
/// verification result still applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// What the verifier saw on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub fingerprint: Fingerprint,
    /// `None` when verification stopped at the size check.
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub status: ModelStatus,
    pub observation: Option<Observation>,
}

/// Stat a model path. `Ok(None)` if nothing exists there.
pub fn fingerprint(path: &Path) -> Result<Option<Fingerprint>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ProvisionError::store_io("inspect", path, err)),
    };

    if !metadata.is_dir() {
        return Ok(Some(Fingerprint {
            size: metadata.len(),
            mtime: mtime_of(path, &metadata)?,
        }));
    }

    let mut size = 0u64;
    let mut newest = mtime_of(path, &metadata)?;
    for entry in WalkDir::new(path).min_depth(1) {
        let entry = entry.map_err(|err| walk_error(path, err))?;
        let metadata = entry.metadata().map_err(|err| walk_error(path, err))?;
        if metadata.is_file() {
            size += metadata.len();
        }
        newest = newest.max(mtime_of(entry.path(), &metadata)?);
    }
    Ok(Some(Fingerprint {
        size,
        mtime: newest,
    }))
}

/// SHA-256 of a file or directory tree, lowercase hex.
pub fn hash_path(path: &Path) -> Result<String> {
    let metadata =
        fs::metadata(path).map_err(|err| ProvisionError::store_io("inspect", path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    if !metadata.is_dir() {
        stream_into(&mut hasher, path, &mut buffer)?;
        return Ok(format!("{:x}", hasher.finalize()));
    }

    for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| walk_error(path, err))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(path)
            .map_err(|_| {
                ProvisionError::store_io(
                    "hash",
                    entry.path(),
                    io::Error::new(io::ErrorKind::Other, "entry outside of hashed tree"),
                )
            })?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let len = entry.metadata().map_err(|err| walk_error(path, err))?.len();

        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(len.to_le_bytes());
        stream_into(&mut hasher, entry.path(), &mut buffer)?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare what is at `path` against the expected digest and size.
pub fn verify(path: &Path, expected_hash: &str, expected_size: u64) -> Result<Verification> {
    let Some(fingerprint) = fingerprint(path)? else {
        return Ok(Verification {
            status: ModelStatus::Missing,
            observation: None,
        });
    };

    if fingerprint.size != expected_size {
        tracing::debug!(
            path = %path.display(),
            expected_size,
            actual_size = fingerprint.size,
            "size mismatch, skipping hash"
        );
        return Ok(Verification {
            status: ModelStatus::Corrupt,
            observation: Some(Observation {
                fingerprint,
                hash: None,
            }),
        });
    }

    let hash = hash_path(path)?;
    let status = if hash.eq_ignore_ascii_case(expected_hash) {
        ModelStatus::Installed
    } else {
        tracing::debug!(path = %path.display(), expected = expected_hash, actual = %hash, "hash mismatch");
        ModelStatus::Corrupt
    };
    Ok(Verification {
        status,
        observation: Some(Observation {
            fingerprint,
            hash: Some(hash),
        }),
    })
}

/// Verify one manifest entry below `root`.
pub fn verify_model(root: &Path, model: &ModelDescriptor) -> Result<Verification> {
    verify(
        &model.path_in(root),
        &model.expected_hash,
        model.expected_size,
    )
}

fn stream_into(hasher: &mut Sha256, path: &Path, buffer: &mut [u8]) -> Result<()> {
    let mut file = File::open(path).map_err(|err| ProvisionError::store_io("open", path, err))?;
    loop {
        let read = match file.read(buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ProvisionError::store_io("read", path, err)),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(())
}

fn mtime_of(path: &Path, metadata: &fs::Metadata) -> Result<DateTime<Utc>> {
    let modified: SystemTime = metadata
        .modified()
        .map_err(|err| ProvisionError::store_io("read modification time of", path, err))?;
    Ok(DateTime::<Utc>::from(modified))
}

fn walk_error(root: &Path, err: walkdir::Error) -> ProvisionError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let io_err = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
    ProvisionError::store_io("walk", path, io_err)
}
