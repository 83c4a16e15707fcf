/// Per-item encryption under a random data encryption key (DEK).
///
/// ```text
/// payload     = XChaCha20-Poly1305(DEK, nonce,     json(item), aad = "payload" || item_id)
/// wrapped_dek = XChaCha20-Poly1305(MK,  dek_nonce, DEK,        aad = "dek"     || item_id)
/// ```
///
/// Rotating the master key only re-wraps the DEK; the payload is untouched.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::crypto::{aead, sensitive::SensitiveBytes32};
use crate::envelope::MasterKey;
use crate::error::{Result, VaultError};
use crate::storage::{self, BlobStore};

const PAYLOAD_AAD_DOMAIN: &[u8] = b"pqvault-item-payload-v1:";
const DEK_AAD_DOMAIN: &[u8] = b"pqvault-item-dek-v1:";

/// Plaintext vault entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultItem {
    pub id: Uuid,
    pub title: String,
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl VaultItem {
    pub fn new(title: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            title: title.into(),
            username: username.into(),
            password: password.into(),
            url: None,
            notes: None,
        }
    }
}

/// Encrypted vault entry as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultItemRecord {
    pub id: Uuid,
    pub algorithm: String,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub encrypted_payload: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub auth_tag: Vec<u8>,
    /// DEK ciphertext followed by its tag.
    #[serde(with = "crate::encoding::hex_bytes")]
    pub wrapped_dek: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub dek_nonce: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

fn aad(domain: &[u8], id: &Uuid) -> Vec<u8> {
    let mut aad = domain.to_vec();
    aad.extend_from_slice(id.as_bytes());
    aad
}

fn item_key(id: &Uuid) -> String {
    format!("item/{id}")
}

pub struct ItemCipher {
    store: Arc<dyn BlobStore>,
}

impl ItemCipher {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub fn encrypt_item(&self, item: &VaultItem, master_key: &MasterKey) -> Result<VaultItemRecord> {
        let dek = aead::generate_key();

        let mut plaintext = serde_json::to_vec(item)?;
        let sealed = aead::seal_detached(&dek, &plaintext, &aad(PAYLOAD_AAD_DOMAIN, &item.id));
        plaintext.zeroize();
        let sealed = sealed?;

        let (dek_nonce, wrapped_dek) =
            aead::encrypt(master_key.key(), dek.as_bytes(), &aad(DEK_AAD_DOMAIN, &item.id))?;

        debug!(item_id = %item.id, size = sealed.ciphertext.len(), "Item encrypted");

        Ok(VaultItemRecord {
            id: item.id,
            algorithm: aead::ALGORITHM.to_string(),
            encrypted_payload: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            auth_tag: sealed.tag.to_vec(),
            wrapped_dek,
            dek_nonce: dek_nonce.to_vec(),
            created_at: Utc::now(),
        })
    }

    fn unwrap_dek(record: &VaultItemRecord, master_key: &MasterKey) -> Result<SensitiveBytes32> {
        let dek_nonce = aead::nonce_from_slice(&record.dek_nonce)?;
        let mut dek_bytes = aead::decrypt(
            master_key.key(),
            &dek_nonce,
            &record.wrapped_dek,
            &aad(DEK_AAD_DOMAIN, &record.id),
        )?;
        let dek = SensitiveBytes32::from_slice(&dek_bytes);
        dek_bytes.zeroize();
        dek.ok_or_else(|| VaultError::Decryption("wrapped DEK has wrong length".into()))
    }

    /// Any tampering or a wrong master key yields `AuthenticationTagMismatch`.
    pub fn decrypt_item(&self, record: &VaultItemRecord, master_key: &MasterKey) -> Result<VaultItem> {
        if record.algorithm != aead::ALGORITHM {
            return Err(VaultError::Decryption(format!(
                "unsupported item algorithm {}",
                record.algorithm
            )));
        }

        let dek = Self::unwrap_dek(record, master_key)?;
        let mut plaintext = aead::open_detached(
            &dek,
            &record.nonce,
            &record.encrypted_payload,
            &record.auth_tag,
            &aad(PAYLOAD_AAD_DOMAIN, &record.id),
        )?;
        let item: std::result::Result<VaultItem, _> = serde_json::from_slice(&plaintext);
        plaintext.zeroize();
        let item = item?;

        if item.id != record.id {
            return Err(VaultError::Decryption("item id does not match record".into()));
        }
        Ok(item)
    }

    /// Re-wrap the DEK from `old_key` to `new_key`. Payload bytes are unchanged.
    pub fn rewrap_item(
        &self,
        record: &VaultItemRecord,
        old_key: &MasterKey,
        new_key: &MasterKey,
    ) -> Result<VaultItemRecord> {
        let dek = Self::unwrap_dek(record, old_key)?;
        let (dek_nonce, wrapped_dek) =
            aead::encrypt(new_key.key(), dek.as_bytes(), &aad(DEK_AAD_DOMAIN, &record.id))?;
        Ok(VaultItemRecord {
            wrapped_dek,
            dek_nonce: dek_nonce.to_vec(),
            ..record.clone()
        })
    }

    pub async fn put_item(&self, record: &VaultItemRecord) -> Result<()> {
        storage::put_json(self.store.as_ref(), &item_key(&record.id), record).await
    }

    pub async fn get_item(&self, id: &Uuid) -> Result<VaultItemRecord> {
        storage::get_json(self.store.as_ref(), &item_key(id))
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("item {id}")))
    }

    pub async fn delete_item(&self, id: &Uuid) -> Result<()> {
        self.store.delete(&item_key(id)).await
    }

    pub async fn list_items(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .store
            .list("item/")
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix("item/"))
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }
}
