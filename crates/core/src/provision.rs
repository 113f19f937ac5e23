use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadConfig;
use crate::downloaders::DownloadManager;
use crate::error::{ProvisionError, Result};
use crate::extract;
use crate::manifest::ModelPackManifest;
use crate::progress::ProgressSink;
use crate::registry::{StatusRegistry, StatusReport};
use crate::status::ModelStatus;

/// Outcome of a successful `download`.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub models: StatusReport,
    pub pack_size: u64,
    pub pack_sha256: String,
}

/// Entry point for provisioning one model store.
///
/// At most one download runs per provisioner; `check` can run alongside it
/// and keeps reporting the pre-download state until the new pack is promoted.
pub struct Provisioner {
    registry: Arc<StatusRegistry>,
    downloads: DownloadManager,
    pack_url: String,
    busy: Arc<Mutex<()>>,
}

impl Provisioner {
    pub fn open(
        store_root: impl Into<PathBuf>,
        manifest: ModelPackManifest,
        download: &DownloadConfig,
    ) -> Result<Self> {
        let pack_url = manifest.pack_url.clone();
        Ok(Self {
            registry: Arc::new(StatusRegistry::open(store_root, manifest)?),
            downloads: DownloadManager::new(download)?,
            pack_url,
            busy: Arc::new(Mutex::new(())),
        })
    }

    /// Fetch the pack from `url` instead of the manifest's `pack_url`.
    pub fn with_pack_url(mut self, url: impl Into<String>) -> Self {
        self.pack_url = url.into();
        self
    }

    pub fn pack_url(&self) -> &str {
        &self.pack_url
    }

    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    pub fn is_busy(&self) -> bool {
        self.busy.try_lock().is_err()
    }

    /// Per-model status without network access. Hashing runs on the blocking pool.
    pub async fn check(&self, ids: Option<Vec<String>>) -> Result<StatusReport> {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || registry.check(ids.as_deref()))
            .await
            .map_err(|err| self.join_error(err))?
    }

    /// Status including in-flight download phases, for progress displays.
    pub async fn snapshot(&self) -> Result<StatusReport> {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || registry.snapshot())
            .await
            .map_err(|err| self.join_error(err))?
    }

    /// Delete one model. Refused while a download is running.
    pub async fn remove(&self, model_id: &str) -> Result<bool> {
        let _guard = self.busy.try_lock().map_err(|_| ProvisionError::Busy)?;
        let registry = Arc::clone(&self.registry);
        let model_id = model_id.to_string();
        tokio::task::spawn_blocking(move || registry.remove(&model_id))
            .await
            .map_err(|err| self.join_error(err))?
    }

    /// Download, verify and install the whole pack.
    ///
    /// Either every declared model ends up installed or the store is left
    /// exactly as it was.
    pub async fn download(
        &self,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<InstallReport> {
        let _guard = self.busy.try_lock().map_err(|_| ProvisionError::Busy)?;
        let _in_flight = InFlight::start(&self.registry);

        let work_dir = extract::work_dir_for(self.registry.root());
        let pack = self
            .downloads
            .fetch(
                &self.pack_url,
                &work_dir,
                self.registry.manifest().pack_hash.as_deref(),
                &progress,
                &cancel,
            )
            .await?;
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }

        self.registry.set_in_flight(ModelStatus::Verifying);
        let pack_size = pack.size;
        let pack_sha256 = pack.sha256.clone();
        let registry = Arc::clone(&self.registry);
        let models = tokio::task::spawn_blocking(move || {
            let result = extract::extract_and_install(&pack.path, &registry, &progress);
            drop(pack);
            result
        })
        .await
        .map_err(|err| self.join_error(err))??;

        Ok(InstallReport {
            models,
            pack_size,
            pack_sha256,
        })
    }

    /// Run [`download`](Self::download) on a background task.
    pub fn spawn_download(self: &Arc<Self>, progress: ProgressSink) -> DownloadTask {
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.download(progress, token).await });
        DownloadTask {
            cancel,
            handle,
            store_root: self.registry.root().to_path_buf(),
        }
    }

    fn join_error(&self, err: tokio::task::JoinError) -> ProvisionError {
        ProvisionError::store_io(
            "finish work on",
            self.registry.root(),
            io::Error::new(io::ErrorKind::Other, err.to_string()),
        )
    }
}

/// Handle to a download running in the background.
pub struct DownloadTask {
    cancel: CancellationToken,
    handle: JoinHandle<Result<InstallReport>>,
    store_root: PathBuf,
}

impl DownloadTask {
    /// Ask the download to stop at the next chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<InstallReport> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(ProvisionError::store_io(
                "finish download into",
                &self.store_root,
                io::Error::new(io::ErrorKind::Other, err.to_string()),
            )),
        }
    }
}

/// Marks every model as downloading for the lifetime of the guard.
struct InFlight<'a>(&'a StatusRegistry);

impl<'a> InFlight<'a> {
    fn start(registry: &'a StatusRegistry) -> Self {
        registry.set_in_flight(ModelStatus::Downloading);
        InFlight(registry)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.clear_in_flight();
    }
}
