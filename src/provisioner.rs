//! Makes sure the model artifact is on local disk before it is loaded.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Failed to create HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("Download of {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Download of {url} failed with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Failed to write artifact to {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Provisioned {
    AlreadyPresent,
    Downloaded { bytes: u64 },
}

pub fn build_client(timeout: Duration) -> Result<reqwest::Client, ProvisionError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(ProvisionError::Client)
}

/// Downloads `url` to `destination` unless a file is already there.
///
/// The body is streamed into a `.part` sibling and renamed into place once
/// complete, so an interrupted download never leaves a truncated artifact at
/// `destination`. A single attempt is made.
pub async fn ensure_artifact(
    client: &reqwest::Client,
    url: &str,
    destination: &Path,
) -> Result<Provisioned, ProvisionError> {
    let present = fs::try_exists(destination)
        .await
        .map_err(|source| ProvisionError::Io {
            path: destination.to_path_buf(),
            source,
        })?;
    if present {
        tracing::info!("Artifact already present at {:?}", destination);
        return Ok(Provisioned::AlreadyPresent);
    }

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| ProvisionError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    tracing::info!("Downloading artifact from {} to {:?}", url, destination);

    let temp_path = partial_path(destination);
    match download(client, url, &temp_path).await {
        Ok(bytes) => {
            fs::rename(&temp_path, destination)
                .await
                .map_err(|source| ProvisionError::Io {
                    path: destination.to_path_buf(),
                    source,
                })?;
            tracing::info!("Downloaded {} bytes to {:?}", bytes, destination);
            Ok(Provisioned::Downloaded { bytes })
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(e)
        }
    }
}

async fn download(
    client: &reqwest::Client,
    url: &str,
    temp_path: &Path,
) -> Result<u64, ProvisionError> {
    let request_error = |source| ProvisionError::Request {
        url: url.to_string(),
        source,
    };
    let io_error = |source| ProvisionError::Io {
        path: temp_path.to_path_buf(),
        source,
    };

    let mut response = client.get(url).send().await.map_err(request_error)?;

    if !response.status().is_success() {
        return Err(ProvisionError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let mut file = fs::File::create(temp_path).await.map_err(io_error)?;
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(request_error)? {
        file.write_all(&chunk).await.map_err(io_error)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(io_error)?;

    Ok(written)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
