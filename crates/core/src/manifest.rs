//! Static description of the model set a pack is expected to contain.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{ProvisionError, Result};
use crate::ledger::LEDGER_FILE_NAME;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    /// File or directory below the store root.
    pub relative_path: PathBuf,
    /// Lowercase hex SHA-256, see [`crate::verify::hash_path`].
    pub expected_hash: String,
    pub expected_size: u64,
}

impl ModelDescriptor {
    pub fn title(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPackManifest {
    pub pack_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_hash: Option<String>,
    pub models: Vec<ModelDescriptor>,
}

impl ModelPackManifest {
    /// Load and validate a manifest from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ProvisionError::Manifest(format!("cannot read {}: {}", path.display(), err))
        })?;
        Self::from_toml(&content)
            .map_err(|err| ProvisionError::Manifest(format!("{}: {}", path.display(), manifest_detail(err))))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let manifest: ModelPackManifest =
            toml::from_str(content).map_err(|err| ProvisionError::Manifest(err.to_string()))?;
        manifest.validated()
    }

    /// Check structural rules and normalize hashes to lowercase.
    pub fn validated(mut self) -> Result<Self> {
        if self.models.is_empty() {
            return Err(ProvisionError::Manifest("no models declared".into()));
        }

        if let Some(hash) = self.pack_hash.take() {
            let hash = hash.trim().to_ascii_lowercase();
            if !hash.is_empty() {
                check_hash("pack_hash", &hash)?;
                self.pack_hash = Some(hash);
            }
        }

        let mut ids = HashSet::new();
        for model in &mut self.models {
            if model.id.trim().is_empty() {
                return Err(ProvisionError::Manifest("model with empty id".into()));
            }
            if !ids.insert(model.id.clone()) {
                return Err(ProvisionError::Manifest(format!(
                    "duplicate model id '{}'",
                    model.id
                )));
            }
            model.relative_path = normalized_relative_path(&model.id, &model.relative_path)?;
            model.expected_hash = model.expected_hash.trim().to_ascii_lowercase();
            check_hash(&model.id, &model.expected_hash)?;
        }

        for (i, a) in self.models.iter().enumerate() {
            for b in &self.models[i + 1..] {
                if a.relative_path.starts_with(&b.relative_path)
                    || b.relative_path.starts_with(&a.relative_path)
                {
                    return Err(ProvisionError::Manifest(format!(
                        "models '{}' and '{}' overlap at {}",
                        a.id,
                        b.id,
                        a.relative_path.display()
                    )));
                }
            }
        }

        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Resolve requested ids against the manifest, all models when `None`.
    pub fn select(&self, ids: Option<&[String]>) -> Result<Vec<&ModelDescriptor>> {
        match ids {
            None => Ok(self.models.iter().collect()),
            Some(ids) => ids
                .iter()
                .map(|id| {
                    self.get(id).ok_or_else(|| {
                        ProvisionError::Manifest(format!("unknown model id '{}'", id))
                    })
                })
                .collect(),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.id.as_str())
    }
}

fn manifest_detail(err: ProvisionError) -> String {
    match err {
        ProvisionError::Manifest(detail) => detail,
        other => other.to_string(),
    }
}

fn check_hash(owner: &str, hash: &str) -> Result<()> {
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProvisionError::Manifest(format!(
            "{}: expected a 64-character SHA-256 hex digest, got '{}'",
            owner, hash
        )));
    }
    Ok(())
}

/// Keep only the named components of `path`, rejecting anything that could
/// leave the store root.
fn normalized_relative_path(id: &str, path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ProvisionError::Manifest(format!(
                    "{}: relative_path must stay inside the store, got {}",
                    id,
                    path.display()
                )))
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(ProvisionError::Manifest(format!("{}: empty relative_path", id)));
    }
    if normalized.starts_with(LEDGER_FILE_NAME) {
        return Err(ProvisionError::Manifest(format!(
            "{}: relative_path collides with the ledger file",
            id
        )));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H1: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
    const H2: &str = "60303ae22b998861bce3b28f33eec1be758a213c86c93c076dbe9f558c11c752";

    fn manifest_toml(models: &str) -> String {
        format!("pack_url = \"https://example.invalid/ModelPack.zip\"\n{}", models)
    }

    #[test]
    fn parses_and_normalizes_hashes() {
        let toml = manifest_toml(&format!(
            r#"
pack_hash = "{pack}"

[[models]]
id = "phikon_v2"
display_name = "Phikon v2 (zones)"
relative_path = "phikon_v2"
expected_hash = "{h1}"
expected_size = 4

[[models]]
id = "sam_checkpoint"
relative_path = "sam/sam_vit_h.pth"
expected_hash = "{h2}"
expected_size = 8
"#,
            pack = H1.to_uppercase(),
            h1 = H1.to_uppercase(),
            h2 = H2,
        ));
        let manifest = ModelPackManifest::from_toml(&toml).unwrap();
        assert_eq!(manifest.pack_hash.as_deref(), Some(H1));
        assert_eq!(manifest.models[0].expected_hash, H1);
        assert_eq!(manifest.models[0].title(), "Phikon v2 (zones)");
        assert_eq!(manifest.models[1].title(), "sam_checkpoint");
        assert_eq!(
            manifest.ids().collect::<Vec<_>>(),
            vec!["phikon_v2", "sam_checkpoint"]
        );
    }

    #[test]
    fn empty_pack_hash_means_undeclared() {
        let toml = manifest_toml(&format!(
            "pack_hash = \"\"\n[[models]]\nid = \"m1\"\nrelative_path = \"m1.bin\"\nexpected_hash = \"{}\"\nexpected_size = 1\n",
            H1
        ));
        let manifest = ModelPackManifest::from_toml(&toml).unwrap();
        assert_eq!(manifest.pack_hash, None);
    }

    fn single(id: &str, path: &str, hash: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            display_name: String::new(),
            relative_path: PathBuf::from(path),
            expected_hash: hash.into(),
            expected_size: 1,
        }
    }

    fn manifest_of(models: Vec<ModelDescriptor>) -> ModelPackManifest {
        ModelPackManifest {
            pack_url: "https://example.invalid/pack.zip".into(),
            pack_hash: None,
            models,
        }
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = manifest_of(vec![single("m1", "a.bin", H1), single("m1", "b.bin", H2)])
            .validated()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate model id"));
    }

    #[test]
    fn rejects_paths_escaping_the_store() {
        for path in ["../evil.bin", "/etc/passwd", "", "a/../../b"] {
            let err = manifest_of(vec![single("m1", path, H1)])
                .validated()
                .unwrap_err();
            assert!(matches!(err, ProvisionError::Manifest(_)), "{path}");
        }
    }

    #[test]
    fn rejects_ledger_collision_and_nested_models() {
        let err = manifest_of(vec![single("m1", LEDGER_FILE_NAME, H1)])
            .validated()
            .unwrap_err();
        assert!(err.to_string().contains("ledger"));

        let err = manifest_of(vec![
            single("cellpose", "cellpose", H1),
            single("nuclei", "cellpose/nuclei", H2),
        ])
        .validated()
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));

        let err = manifest_of(vec![single("m1", "./.modelpack-ledger.json", H1)])
            .validated()
            .unwrap_err();
        assert!(err.to_string().contains("ledger"));

        let err = manifest_of(vec![single("a", "m.bin", H1), single("b", "./m.bin", H2)])
            .validated()
            .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn current_dir_components_are_dropped() {
        let manifest = manifest_of(vec![single("sam", "./sam/./sam_vit_h.pth", H1)])
            .validated()
            .unwrap();
        assert_eq!(manifest.models[0].relative_path, PathBuf::from("sam/sam_vit_h.pth"));
    }

    #[test]
    fn rejects_malformed_hash() {
        let err = manifest_of(vec![single("m1", "m1.bin", "abc")])
            .validated()
            .unwrap_err();
        assert!(err.to_string().contains("SHA-256"));
    }

    #[test]
    fn select_reports_unknown_ids() {
        let manifest = manifest_of(vec![single("m1", "m1.bin", H1)]).validated().unwrap();
        assert_eq!(manifest.select(None).unwrap().len(), 1);
        let err = manifest.select(Some(&["nope".to_string()])).unwrap_err();
        assert!(err.to_string().contains("unknown model id 'nope'"));
    }

    #[test]
    fn missing_file_is_a_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelPackManifest::load(&dir.path().join("manifest.toml")).unwrap_err();
        assert_eq!(err.kind(), "manifest");
    }
}
