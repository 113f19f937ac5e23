use serde::{Deserialize, Serialize};
use std::fmt;

/// Install state of one model id.
///
/// `Downloading` and `Verifying` only exist while a download is in flight and
/// are never written to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Missing,
    Downloading,
    Verifying,
    Installed,
    Corrupt,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Missing => "missing",
            ModelStatus::Downloading => "downloading",
            ModelStatus::Verifying => "verifying",
            ModelStatus::Installed => "installed",
            ModelStatus::Corrupt => "corrupt",
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, ModelStatus::Installed)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
