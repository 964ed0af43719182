//! Storage adapter: persists photo bytes under a local filesystem tree and
//! hands back stable keys and display URLs. Every error is an explicit
//! return value; nothing here panics past the boundary.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::any::Any;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Metadata for one persisted photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub storage_key: String,
    pub display_url: String,
    pub original_name: String,
    pub byte_size: u64,
}

#[async_trait]
pub trait Storage: Send + Sync + Any {
    /// Persist `bytes` under a fresh key derived from `suggested_name`.
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<SavedFile>;

    /// Remove a stored object. Deleting an absent key is an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Copy an object to a new key (e.g. batch-scoped → permanent).
    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()>;

    /// Read an object's bytes back (the vision client resolves photo
    /// references to bytes before dispatch).
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed storage rooted at `root`. Keys are relative paths under
/// the root; display URLs are `/media/{key}`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        // Keys are generated by this adapter; reject anything that could
        // escape the root.
        let path = Path::new(key);
        if path.is_absolute() || path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(anyhow!("invalid storage key: {}", key));
        }
        Ok(self.root.join(path))
    }
}

fn sanitize_stem(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("photo");
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}

#[async_trait]
impl Storage for LocalStorage {
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<SavedFile> {
        let key = format!(
            "batch/{}_{}.{}",
            sanitize_stem(suggested_name),
            Uuid::new_v4().simple(),
            extension_of(suggested_name),
        );
        let path = self.resolve(&key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create dir: {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write: {}", path.display()))?;
        Ok(SavedFile {
            display_url: format!("/media/{}", key),
            storage_key: key,
            original_name: suggested_name.to_string(),
            byte_size: bytes.len() as u64,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to delete: {}", path.display()))
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let src = self.resolve(source_key)?;
        let dst = self.resolve(dest_key)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create dir: {}", parent.display()))?;
        }
        tokio::fs::copy(&src, &dst)
            .await
            .with_context(|| format!("failed to copy {} -> {}", src.display(), dst.display()))?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_read_delete_round_trip() {
        let td = tempdir().unwrap();
        let storage = LocalStorage::new(td.path());

        let saved = storage.save(b"jpeg bytes", "Front label.jpg").await.unwrap();
        assert!(saved.storage_key.starts_with("batch/Front_label_"));
        assert!(saved.storage_key.ends_with(".jpg"));
        assert_eq!(saved.display_url, format!("/media/{}", saved.storage_key));
        assert_eq!(saved.byte_size, 10);

        let bytes = storage.read(&saved.storage_key).await.unwrap();
        assert_eq!(bytes, b"jpeg bytes");

        storage.delete(&saved.storage_key).await.unwrap();
        assert!(storage.read(&saved.storage_key).await.is_err());
    }

    #[tokio::test]
    async fn copy_creates_destination_tree() {
        let td = tempdir().unwrap();
        let storage = LocalStorage::new(td.path());
        let saved = storage.save(b"x", "a.png").await.unwrap();

        storage
            .copy(&saved.storage_key, "medicines/7/a.png")
            .await
            .unwrap();
        assert_eq!(storage.read("medicines/7/a.png").await.unwrap(), b"x");
        // Source untouched.
        assert_eq!(storage.read(&saved.storage_key).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn delete_missing_key_is_an_error_value() {
        let td = tempdir().unwrap();
        let storage = LocalStorage::new(td.path());
        assert!(storage.delete("batch/nope.jpg").await.is_err());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let td = tempdir().unwrap();
        let storage = LocalStorage::new(td.path());
        assert!(storage.read("../etc/passwd").await.is_err());
        assert!(storage.delete("/abs/path").await.is_err());
    }
}
