use anyhow::{Context, Result};
use modelpack_core::verify;
use std::path::Path;

/// Print the digest and size of a file or directory in manifest form.
pub async fn execute(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    let (fingerprint, digest) = tokio::task::spawn_blocking(move || {
        let fingerprint = verify::fingerprint(&path)?
            .with_context(|| format!("{} does not exist", path.display()))?;
        let digest = verify::hash_path(&path)?;
        anyhow::Ok((fingerprint, digest))
    })
    .await??;

    println!("expected_hash = \"{}\"", digest);
    println!("expected_size = {}", fingerprint.size);

    Ok(())
}
