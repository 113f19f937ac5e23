use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::status::ModelStatus;

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

/// Terminal failures of a provisioning operation.
///
/// Every variant renders a message that tells the user what happened and what
/// to do next; callers can show `to_string()` directly.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("could not download the model pack ({0}). Check the network connection or pack location and run download again")]
    Network(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("the downloaded model pack is corrupted: {0}. Run download again")]
    PackIntegrity(String),

    #[error("model pack did not verify after extraction: {}. Nothing was installed", FailureList(.0))]
    ModelIntegrity(Vec<ModelFailure>),

    #[error("another model download is already running for this store")]
    Busy,

    #[error("could not {action} {}: {source}", .path.display())]
    StoreIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("model manifest problem: {0}")]
    Manifest(String),
}

impl ProvisionError {
    pub fn store_io(action: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        ProvisionError::StoreIo {
            action,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Network(_) => "network",
            ProvisionError::Cancelled => "cancelled",
            ProvisionError::PackIntegrity(_) => "pack-integrity",
            ProvisionError::ModelIntegrity(_) => "model-integrity",
            ProvisionError::Busy => "busy",
            ProvisionError::StoreIo { .. } => "store-io",
            ProvisionError::Manifest(_) => "manifest",
        }
    }
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        ProvisionError::Network(err.to_string())
    }
}

/// A declared model that did not verify in staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFailure {
    pub model_id: String,
    pub status: ModelStatus,
}

struct FailureList<'a>(&'a [ModelFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} is {}", failure.model_id, failure.status.as_str())?;
        }
        Ok(())
    }
}
