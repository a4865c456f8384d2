//! Droplet tarball sources.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::StagingError;

/// Fetches droplet tarballs.
#[async_trait]
pub trait BitsSource: Send + Sync {
    /// Writes the bits at `uri` to `dest`, returning the number of bytes.
    async fn fetch(&self, uri: &str, dest: &Path) -> Result<u64, StagingError>;
}

/// Downloads tarballs over HTTP, streaming them to disk.
pub struct HttpBitsSource {
    client: reqwest::Client,
}

impl HttpBitsSource {
    pub fn new(timeout: Duration) -> Result<Self, StagingError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BitsSource for HttpBitsSource {
    async fn fetch(&self, uri: &str, dest: &Path) -> Result<u64, StagingError> {
        debug!(uri = %uri, dest = %dest.display(), "Downloading droplet");

        let response = self.client.get(uri).send().await?;
        if !response.status().is_success() {
            return Err(StagingError::Download {
                uri: uri.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        info!(uri = %uri, size = total, "Droplet downloaded");
        Ok(total)
    }
}
