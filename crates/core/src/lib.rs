//! modelpack_core - Core library for offline model provisioning
//!
//! This crate provides:
//! - Model pack manifest and per-model integrity verification
//! - Pack download over HTTP or from a local file, with cancellation
//! - Staged extraction and all-or-nothing promotion into the model store
//! - Ledger-backed status registry (`check`) and the `download` command

pub mod config;
pub mod downloaders;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod manifest;
pub mod progress;
pub mod provision;
pub mod registry;
pub mod status;
pub mod verify;

pub use config::Config;
pub use error::{ProvisionError, Result};
pub use manifest::{ModelDescriptor, ModelPackManifest};
pub use progress::{ProgressEvent, ProgressSink};
pub use provision::{DownloadTask, InstallReport, Provisioner};
pub use registry::{ModelState, StatusRegistry, StatusReport};
pub use status::ModelStatus;
