use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::{PackFetcher, PackWriter};
use crate::error::{ProvisionError, Result};
use crate::progress::{ProgressEvent, ProgressSink};

const CHUNK_SIZE: usize = 512 * 1024;

/// Copies a pack that was carried to the machine by hand (USB stick, share).
pub struct LocalFetcher;

#[async_trait]
impl PackFetcher for LocalFetcher {
    async fn fetch_into(
        &self,
        path: &str,
        writer: &mut PackWriter,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|err| ProvisionError::Network(format!("cannot open pack {}: {}", path, err)))?;
        let total = file.metadata().await.ok().map(|m| m.len());
        progress.emit(ProgressEvent::Started { total });

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|err| ProvisionError::Network(format!("cannot read pack {}: {}", path, err)))?;
            if read == 0 {
                break;
            }
            writer.write_chunk(&buffer[..read]).await?;
            progress.emit(ProgressEvent::Received {
                bytes: writer.written(),
                total,
            });
        }
        Ok(())
    }
}
