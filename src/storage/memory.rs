use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::BlobStore;
use crate::error::Result;

/// Process-local store for tests and embedding applications.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
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
impl BlobStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        debug!(key, size = data.len(), "MemoryStore put");
        self.blobs.write().await.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{get_json, put_json};

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("a/1", b"one").await.unwrap();
        assert_eq!(store.get("a/1").await.unwrap(), Some(b"one".to_vec()));

        store.delete("a/1").await.unwrap();
        assert_eq!(store.get("a/1").await.unwrap(), None);
        store.delete("a/1").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryStore::new();
        for key in ["wrap/b", "wrap/a", "kit/x", "wrapx"] {
            store.put(key, b"").await.unwrap();
        }
        assert_eq!(store.list("wrap/").await.unwrap(), vec!["wrap/a", "wrap/b"]);
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        put_json(&store, "doc", &vec![1u32, 2, 3]).await.unwrap();
        let back: Option<Vec<u32>> = get_json(&store, "doc").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        let missing: Option<Vec<u32>> = get_json(&store, "nope").await.unwrap();
        assert!(missing.is_none());
    }
}
