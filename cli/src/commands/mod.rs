pub mod check;
pub mod config;
pub mod download;
pub mod hash;
pub mod remove;

use anyhow::{Context, Result};
use clap::Args;
use modelpack_core::{Config, ModelPackManifest, Provisioner};
use std::path::PathBuf;

/// Per-invocation overrides of the configuration file.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Model store directory
    #[arg(long, global = true, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Manifest listing the expected models
    #[arg(long, global = true, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Pack location (http(s) URL, file:// URL or path)
    #[arg(long, global = true, value_name = "URL")]
    pub pack: Option<String>,
}

/// Build a provisioner from the config file and command-line overrides.
pub fn open_provisioner(overrides: &Overrides) -> Result<Provisioner> {
    let config = Config::load()?;

    let store = overrides
        .store
        .clone()
        .unwrap_or_else(|| config.store_dir());
    let manifest_path = overrides
        .manifest
        .clone()
        .unwrap_or_else(|| config.pack.manifest.clone());
    let manifest = ModelPackManifest::load(&manifest_path)
        .context("Set `pack.manifest` with `modelpack config` or pass --manifest")?;

    let mut provisioner = Provisioner::open(&store, manifest, &config.download)
        .with_context(|| format!("Failed to open model store {}", store.display()))?;
    if let Some(url) = overrides.pack.clone().or(config.pack.url) {
        provisioner = provisioner.with_pack_url(url);
    }
    Ok(provisioner)
}
