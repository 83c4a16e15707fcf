/// Pluggable blob store abstraction.
///
/// The core persists only ciphertext and public metadata: wrapped master keys,
/// encrypted item records, recovery kits and their encrypted shares. Values
/// are JSON documents addressed by a namespaced string key such as
/// `wrap/<device_id>` or `kit/<uuid>`.
pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use memory::MemoryStore;

/// Trait for pluggable persistence backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable name of this backend (e.g., "memory", "postgres").
    fn name(&self) -> &str;

    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns Ok even if the key doesn't exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Serialize `value` as JSON and store it under `key`.
pub async fn put_json<T: Serialize + Sync>(store: &dyn BlobStore, key: &str, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    store.put(key, &data).await
}

pub async fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}
