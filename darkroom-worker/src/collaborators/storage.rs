//! Storage collaborator

use anyhow::{Context, Result};
use async_trait::async_trait;
use darkroom_core::domain::artifact::ArtifactRef;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Object storage for model weights and generated images
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores `bytes` at `destination`, returning the stored location with its size
    async fn upload(&self, bytes: Vec<u8>, destination: &ArtifactRef) -> Result<ArtifactRef>;

    async fn download(&self, location: &ArtifactRef) -> Result<Vec<u8>>;

    /// Downloads straight into a local file, returning the number of bytes written
    async fn download_to(&self, location: &ArtifactRef, target: &Path) -> Result<u64> {
        let bytes = self.download(location).await?;
        tokio::fs::write(target, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
        Ok(bytes.len() as u64)
    }

    /// Public or signed URL for `location`
    fn public_url(&self, location: &ArtifactRef) -> String;

    async fn delete(&self, location: &ArtifactRef) -> Result<()>;
}

/// Storage on the local filesystem, one directory per bucket
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &ArtifactRef) -> Result<PathBuf> {
        let relative = Path::new(&location.bucket).join(&location.path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            anyhow::bail!("Invalid storage location: {}", location);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(&self, bytes: Vec<u8>, destination: &ArtifactRef) -> Result<ArtifactRef> {
        let path = self.resolve(destination)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create storage directory")?;
        }

        let size = bytes.len() as u64;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to store {}", destination))?;

        debug!("Stored {} ({} bytes)", destination, size);
        Ok(ArtifactRef::new(&destination.bucket, &destination.path).with_size(size))
    }

    async fn download(&self, location: &ArtifactRef) -> Result<Vec<u8>> {
        let path = self.resolve(location)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", location))
    }

    async fn download_to(&self, location: &ArtifactRef, target: &Path) -> Result<u64> {
        let path = self.resolve(location)?;
        tokio::fs::copy(&path, target)
            .await
            .with_context(|| format!("Failed to read {}", location))
    }

    fn public_url(&self, location: &ArtifactRef) -> String {
        let path = self.root.join(&location.bucket).join(&location.path);
        format!("file://{}", path.display())
    }

    async fn delete(&self, location: &ArtifactRef) -> Result<()> {
        let path = self.resolve(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", location)),
        }
    }
}
