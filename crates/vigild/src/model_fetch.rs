//! Fallback model provisioning.
//!
//! A model already present on disk always wins. Otherwise, when a download URL
//! is configured, the file is streamed to `<name>.part` and renamed into place
//! once complete.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("model {0} is missing and no download URL is configured")]
    NotConfigured(PathBuf),
    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write model to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the fallback model lives and how to obtain it.
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub path: PathBuf,
    pub url: Option<String>,
}

impl ModelSource {
    /// Ensure the model file exists, downloading it if needed.
    pub async fn ensure(&self) -> Result<PathBuf, FetchError> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(self.path.clone());
        }
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| FetchError::NotConfigured(self.path.clone()))?;

        tracing::info!(url, path = %self.path.display(), "downloading face model");
        download(url, &self.path).await?;
        tracing::info!(path = %self.path.display(), "face model downloaded");
        Ok(self.path.clone())
    }
}

async fn download(url: &str, dest: &Path) -> Result<(), FetchError> {
    let temp_path = dest.with_extension("part");
    let result = download_inner(url, dest, &temp_path).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result
}

async fn download_inner(url: &str, dest: &Path, temp_path: &Path) -> Result<(), FetchError> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| FetchError::Write { path, source }
    };
    let download_err = |source| FetchError::Download {
        url: url.to_string(),
        source,
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(write_err(parent))?;
    }

    let mut response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(download_err)?;

    let mut file = tokio::fs::File::create(temp_path)
        .await
        .map_err(write_err(temp_path))?;

    let mut downloaded: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(download_err)? {
        file.write_all(&chunk).await.map_err(write_err(temp_path))?;
        downloaded += chunk.len() as u64;
    }
    file.flush().await.map_err(write_err(temp_path))?;
    drop(file);

    tracing::debug!(bytes = downloaded, "model download complete");
    tokio::fs::rename(temp_path, dest)
        .await
        .map_err(write_err(dest))?;
    Ok(())
}
