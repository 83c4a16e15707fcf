/// Passphrase-protected export of a single share for offline storage.
///
/// Argon2id(passphrase, salt) → XChaCha20-Poly1305 over the encoded share.
/// The KDF parameters travel with the file.
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::shamir::Share;
use crate::crypto::kdf::{self, KdfParams};
use crate::crypto::{aead, sensitive::SensitiveVec};
use crate::error::{Result, VaultError};

const SHARE_FILE_AAD: &[u8] = b"pqvault-share-file-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareFile {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kit_id: Option<Uuid>,
    pub share_index: u8,
    pub kdf: KdfParams,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub ciphertext: Vec<u8>,
}

impl ShareFile {
    pub const CURRENT_VERSION: u32 = 1;

    fn aad(kit_id: Option<Uuid>, index: u8) -> Vec<u8> {
        let mut aad = SHARE_FILE_AAD.to_vec();
        aad.extend_from_slice(kit_id.unwrap_or_default().as_bytes());
        aad.push(index);
        aad
    }

    pub fn seal(share: &Share, kit_id: Option<Uuid>, passphrase: &[u8], params: &KdfParams) -> Result<Self> {
        let salt = kdf::generate_salt();
        let key = kdf::derive_key(passphrase, &salt, params)?;
        let plaintext = share.to_bytes();
        let (nonce, ciphertext) = aead::encrypt(&key, plaintext.as_bytes(), &Self::aad(kit_id, share.index))?;

        Ok(Self {
            version: Self::CURRENT_VERSION,
            kit_id,
            share_index: share.index,
            kdf: *params,
            salt: salt.to_vec(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// A wrong passphrase surfaces as `AuthenticationTagMismatch`.
    pub fn open(&self, passphrase: &[u8]) -> Result<Share> {
        if self.version != Self::CURRENT_VERSION {
            return Err(VaultError::Decryption(format!(
                "unsupported share file version {}",
                self.version
            )));
        }
        let key = kdf::derive_key(passphrase, &self.salt, &self.kdf)?;
        let nonce = aead::nonce_from_slice(&self.nonce)?;
        let plaintext = SensitiveVec::new(aead::decrypt(
            &key,
            &nonce,
            &self.ciphertext,
            &Self::aad(self.kit_id, self.share_index),
        )?);
        let share = Share::from_bytes(plaintext.as_bytes())?;
        if share.index != self.share_index {
            return Err(VaultError::InconsistentShares("share file index mismatch".into()));
        }
        Ok(share)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), index = self.share_index, "Share file written");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::shamir::{combine, split};

    #[test]
    fn test_seal_open() {
        let params = KdfParams::insecure_for_tests();
        let shares = split(b"offline secret", 3, 2).unwrap();
        let kit = Some(Uuid::new_v4());

        let file = ShareFile::seal(&shares[1], kit, b"pass phrase", &params).unwrap();
        assert_eq!(file.share_index, 1);
        let opened = file.open(b"pass phrase").unwrap();
        assert_eq!(opened, shares[1]);

        assert!(matches!(
            file.open(b"wrong"),
            Err(VaultError::AuthenticationTagMismatch)
        ));
    }

    #[test]
    fn test_header_tampering_detected() {
        let params = KdfParams::insecure_for_tests();
        let shares = split(b"offline secret", 3, 2).unwrap();
        let mut file = ShareFile::seal(&shares[0], None, b"pw", &params).unwrap();
        file.share_index = 2;
        assert!(matches!(file.open(b"pw"), Err(VaultError::AuthenticationTagMismatch)));
    }

    #[test]
    fn test_save_load_combine() {
        let dir = std::env::temp_dir().join(format!("pqvault-share-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let params = KdfParams::insecure_for_tests();
        let shares = split(b"file secret", 3, 2).unwrap();

        let mut opened = Vec::new();
        for share in &shares[..2] {
            let path = dir.join(format!("share-{}.json", share.index));
            ShareFile::seal(share, None, b"pw", &params).unwrap().save(&path).unwrap();
            opened.push(ShareFile::load(&path).unwrap().open(b"pw").unwrap());
        }
        assert_eq!(combine(&opened).unwrap().as_bytes(), b"file secret");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
