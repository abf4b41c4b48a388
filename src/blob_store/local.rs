// Filesystem-backed blob store for development and tests.
//
// Writes go to a temporary sibling and are renamed into place, so readers
// see the complete object or none.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use uuid::Uuid;

use super::{BlobStat, BlobStore, BlobStoreError};

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key to a path under the root, rejecting traversal.
    fn path_for(&self, key: &str) -> Result<PathBuf, BlobStoreError> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(BlobStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobStoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let file = fs::File::create(&staging).await?;
        let mut writer = BufWriter::new(file);
        let written = match tokio::io::copy(reader, &mut writer).await {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                return Err(e.into());
            }
        };
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        fs::rename(&staging, &path).await?;
        Ok(written)
    }

    async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError> {
        let mut reader = std::io::Cursor::new(data.to_vec());
        self.put_stream(key, &mut reader).await?;
        Ok(())
    }

    async fn open_read(
        &self,
        key: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, BlobStoreError> {
        let path = self.path_for(key)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, key: &str) -> Result<BlobStat, BlobStoreError> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(BlobStat { size: meta.len() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn presigned_get(&self, key: &str, _ttl: Duration) -> Result<String, BlobStoreError> {
        // Dev-only token: a file URL. Nothing validates expiry locally.
        let path = self.path_for(key)?;
        if fs::metadata(&path).await.is_err() {
            return Err(BlobStoreError::NotFound(key.to_string()));
        }
        Ok(format!("file://{}", path.to_string_lossy()))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn round_trip_and_stat() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        store.put_bytes("jobs/j1/normalized.wav", b"abcdef").await.unwrap();
        assert_eq!(store.stat("jobs/j1/normalized.wav").await.unwrap().size, 6);

        let mut reader = store.open_read("jobs/j1/normalized.wav").await.unwrap();
        let mut data = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut data)
            .await
            .unwrap();
        assert_eq!(data, b"abcdef");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(matches!(
            store.open_read("nope").await,
            Err(BlobStoreError::NotFound(_))
        ));
        // Delete is idempotent.
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(matches!(
            store.put_bytes("../escape", b"x").await,
            Err(BlobStoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.put_bytes("uploads/u1/chunks/00000", b"a").await.unwrap();
        store.put_bytes("uploads/u1/chunks/00001", b"b").await.unwrap();
        store.put_bytes("jobs/j1/normalized.wav", b"c").await.unwrap();

        let uploads = store.list("uploads/").await.unwrap();
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|k| k.starts_with("uploads/")));
    }
}
