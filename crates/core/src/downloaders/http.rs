use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{PackFetcher, PackWriter};
use crate::config::DownloadConfig;
use crate::error::{ProvisionError, Result};
use crate::progress::{ProgressEvent, ProgressSink};

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|err| ProvisionError::Network(format!("cannot create HTTP client: {}", err)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PackFetcher for HttpFetcher {
    async fn fetch_into(
        &self,
        url: &str,
        writer: &mut PackWriter,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            response = self.client.get(url).send() => response?,
        };

        if !response.status().is_success() {
            return Err(ProvisionError::Network(format!(
                "server answered {} for {}",
                response.status(),
                url
            )));
        }

        let total = response.content_length();
        progress.emit(ProgressEvent::Started { total });

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            writer.write_chunk(&chunk).await?;
            progress.emit(ProgressEvent::Received {
                bytes: writer.written(),
                total,
            });
        }

        if let Some(total) = total {
            if writer.written() != total {
                return Err(ProvisionError::Network(format!(
                    "connection closed after {} of {} bytes",
                    writer.written(),
                    total
                )));
            }
        }
        Ok(())
    }
}
