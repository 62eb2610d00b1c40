use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Opaque blob store keyed by path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Build the storage key for an upload: `{owner}/{timestamp_ms}-{filename}`.
/// Path separators in the filename are flattened so the key stays inside the owner's namespace.
pub fn storage_key(owner: &str, timestamp_ms: i64, filename: &str) -> String {
    let name: String = filename
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{owner}/{timestamp_ms}-{name}")
}

/// Reject keys outside `owner`'s namespace.
pub fn ensure_owned(owner: &str, key: &str) -> Result<()> {
    match key.strip_prefix(owner).and_then(|rest| rest.strip_prefix('/')) {
        Some(rest) if !rest.is_empty() && !owner.is_empty() => Ok(()),
        _ => bail!("storage key {key:?} is outside namespace of {owner:?}"),
    }
}

// ── Filesystem backend ───────────────────────────────────────────────────

/// Blob store rooted at a local directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if path.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob path {path:?}");
        }
        Ok(self.root.join(rel))
    }
}

async fn write_then_rename(temp_path: &Path, full_path: &Path, data: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(temp_path)
        .await
        .with_context(|| format!("create {}", temp_path.display()))?;
    file.write_all(data).await.context("write blob")?;
    file.sync_all().await.context("sync blob")?;
    drop(file);
    tokio::fs::rename(temp_path, full_path)
        .await
        .context("rename blob")
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        debug!(storage_path = %path, size = data.len(), "blob put");

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        // temp file + rename so readers never see a partial blob
        let mut temp_name = full_path.clone().into_os_string();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        if let Err(e) = write_then_rename(&temp_path, &full_path, data).await {
            warn!(temp = %temp_path.display(), "blob write failed: {e:#}");
            if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(temp = %temp_path.display(), "leftover temp blob: {cleanup}");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        tokio::fs::read(&full_path)
            .await
            .with_context(|| format!("read blob {path:?}"))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        if tokio::fs::try_exists(&full_path).await? {
            tokio::fs::remove_file(&full_path)
                .await
                .with_context(|| format!("remove blob {path:?}"))?;
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        Ok(tokio::fs::try_exists(full_path).await?)
    }
}

// ── In-memory backend ────────────────────────────────────────────────────

/// Process-local blob store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .with_context(|| format!("blob {path:?} not found"))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.blobs.write().await.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(path))
    }
}
