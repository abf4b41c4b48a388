// In-memory blob store for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{BlobStat, BlobStore, BlobStoreError};

/// Map-backed store. Cheap to clone; all clones share contents.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    pub fn key_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobStoreError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let len = data.len() as u64;
        self.blobs.lock().unwrap().insert(key.to_string(), data);
        Ok(len)
    }

    async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError> {
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn open_read(
        &self,
        key: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, BlobStoreError> {
        let data = self
            .contents(key)
            .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn stat(&self, key: &str) -> Result<BlobStat, BlobStoreError> {
        let blobs = self.blobs.lock().unwrap();
        let data = blobs
            .get(key)
            .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))?;
        Ok(BlobStat {
            size: data.len() as u64,
        })
    }

    async fn presigned_get(&self, key: &str, _ttl: Duration) -> Result<String, BlobStoreError> {
        if self.contents(key).is_none() {
            return Err(BlobStoreError::NotFound(key.to_string()));
        }
        Ok(format!("memory://{key}"))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
