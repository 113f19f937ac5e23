//! Fetching a model pack into a temporary file next to the store.

pub mod http;
pub mod local;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::error::{ProvisionError, Result};
use crate::progress::{ProgressEvent, ProgressSink};

pub use http::HttpFetcher;
pub use local::LocalFetcher;

/// A transport able to stream a pack into a [`PackWriter`].
#[async_trait]
pub trait PackFetcher: Send + Sync {
    async fn fetch_into(
        &self,
        source: &str,
        writer: &mut PackWriter,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Where a pack comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackSource {
    Http(String),
    Local(PathBuf),
}

impl PackSource {
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(ProvisionError::Manifest("no pack URL configured".into()));
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(PackSource::Http(location.to_string()));
        }
        if let Some(path) = location.strip_prefix("file://") {
            return Ok(PackSource::Local(PathBuf::from(path)));
        }
        if location.contains("://") {
            return Err(ProvisionError::Manifest(format!(
                "unsupported pack URL scheme: {}",
                location
            )));
        }
        Ok(PackSource::Local(PathBuf::from(location)))
    }
}

/// Sink for pack bytes that hashes while it writes.
pub struct PackWriter {
    file: tokio::fs::File,
    path: PathBuf,
    hasher: Sha256,
    written: u64,
}

impl PackWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|err| ProvisionError::store_io("write", &self.path, err))?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

/// A fully received pack. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct FetchedPack {
    pub path: TempPath,
    pub size: u64,
    pub sha256: String,
}

pub struct DownloadManager {
    http: HttpFetcher,
    local: LocalFetcher,
}

impl DownloadManager {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            local: LocalFetcher,
        })
    }

    /// Fetch `location` into a `.part` file inside `work_dir`.
    ///
    /// The partial file never outlives a failure or cancellation. When
    /// `pack_hash` is declared the received bytes must match it.
    pub async fn fetch(
        &self,
        location: &str,
        work_dir: &Path,
        pack_hash: Option<&str>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<FetchedPack> {
        let source = PackSource::parse(location)?;
        let fetcher: &dyn PackFetcher = match &source {
            PackSource::Http(_) => &self.http,
            PackSource::Local(_) => &self.local,
        };
        let source_ref = match &source {
            PackSource::Http(url) => url.clone(),
            PackSource::Local(path) => path.display().to_string(),
        };

        let tmp = tempfile::Builder::new()
            .prefix(".modelpack-")
            .suffix(".part")
            .tempfile_in(work_dir)
            .map_err(|err| ProvisionError::store_io("create download file in", work_dir, err))?;
        let (file, temp_path) = tmp.into_parts();
        let mut writer = PackWriter {
            file: tokio::fs::File::from_std(file),
            path: temp_path.to_path_buf(),
            hasher: Sha256::new(),
            written: 0,
        };

        tracing::info!(source = %source_ref, "fetching model pack");
        fetcher
            .fetch_into(&source_ref, &mut writer, progress, cancel)
            .await
            .map_err(|err| {
                tracing::warn!(source = %source_ref, error = %err, "model pack download failed");
                err
            })?;

        let PackWriter {
            mut file,
            path,
            hasher,
            written,
        } = writer;
        file.flush()
            .await
            .map_err(|err| ProvisionError::store_io("flush", &path, err))?;
        file.sync_all()
            .await
            .map_err(|err| ProvisionError::store_io("sync", &path, err))?;
        drop(file);

        progress.emit(ProgressEvent::CheckingPack);
        let sha256 = format!("{:x}", hasher.finalize());
        if let Some(expected) = pack_hash {
            if !sha256.eq_ignore_ascii_case(expected) {
                tracing::warn!(expected, actual = %sha256, "pack hash mismatch");
                return Err(ProvisionError::PackIntegrity(format!(
                    "SHA-256 mismatch (expected {}, got {})",
                    expected, sha256
                )));
            }
            tracing::info!(sha256 = %sha256, "pack hash accepted");
        }

        Ok(FetchedPack {
            path: temp_path,
            size: written,
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pack_sources() {
        assert_eq!(
            PackSource::parse("https://example.invalid/ModelPack.zip").unwrap(),
            PackSource::Http("https://example.invalid/ModelPack.zip".into())
        );
        assert_eq!(
            PackSource::parse("file:///mnt/usb/ModelPack.zip").unwrap(),
            PackSource::Local(PathBuf::from("/mnt/usb/ModelPack.zip"))
        );
        assert_eq!(
            PackSource::parse("ModelPack.zip").unwrap(),
            PackSource::Local(PathBuf::from("ModelPack.zip"))
        );
        assert!(PackSource::parse("ftp://example.invalid/pack.zip").is_err());
        assert!(PackSource::parse("  ").is_err());
    }

    fn manager() -> DownloadManager {
        DownloadManager::new(&DownloadConfig::default()).unwrap()
    }

    fn part_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|e| e == "part").unwrap_or(false))
            .collect()
    }

    #[tokio::test]
    async fn local_pack_is_copied_and_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let pack = dir.path().join("ModelPack.zip");
        std::fs::write(&pack, b"test").unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();

        let fetched = manager()
            .fetch(
                pack.to_str().unwrap(),
                &work,
                Some("9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"),
                &ProgressSink::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.size, 4);
        assert_eq!(std::fs::read(&fetched.path).unwrap(), b"test");

        let kept = fetched.path.to_path_buf();
        drop(fetched);
        assert!(!kept.exists());
    }

    #[tokio::test]
    async fn pack_hash_mismatch_discards_the_download() {
        let dir = tempfile::tempdir().unwrap();
        let pack = dir.path().join("ModelPack.zip");
        std::fs::write(&pack, b"tampered").unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();

        let err = manager()
            .fetch(
                pack.to_str().unwrap(),
                &work,
                Some(&"00".repeat(32)),
                &ProgressSink::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PackIntegrity(_)));
        assert!(part_files(&work).is_empty());
    }

    #[tokio::test]
    async fn cancelled_local_copy_leaves_no_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let pack = dir.path().join("ModelPack.zip");
        std::fs::write(&pack, vec![1u8; 4 * 1024 * 1024]).unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager()
            .fetch(
                pack.to_str().unwrap(),
                &work,
                None,
                &ProgressSink::none(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled));
        assert!(part_files(&work).is_empty());
    }

    #[tokio::test]
    async fn missing_local_pack_is_a_download_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager()
            .fetch(
                dir.path().join("absent.zip").to_str().unwrap(),
                dir.path(),
                None,
                &ProgressSink::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Network(_)));
        assert!(part_files(dir.path()).is_empty());
    }
}
