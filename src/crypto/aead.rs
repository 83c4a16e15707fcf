/// XChaCha20-Poly1305 AEAD used for every symmetric layer of the vault:
/// master-key wraps, DEK wraps, item payloads, guardian shares and share files.
///
/// The 24-byte nonce of XChaCha20 is large enough for random generation
/// without practical collision risk, so every call draws a fresh nonce.
use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    Key, Tag, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{Result, VaultError};

pub const NONCE_LEN: usize = 24;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

/// Algorithm label persisted alongside ciphertexts.
pub const ALGORITHM: &str = "XChaCha20-Poly1305";

/// Generate a random 256-bit symmetric key.
pub fn generate_key() -> SensitiveBytes32 {
    SensitiveBytes32::random()
}

/// Generate a random 24-byte nonce for XChaCha20-Poly1305.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Output of a detached encryption: ciphertext and tag kept apart.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

fn cipher(key: &SensitiveBytes32) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

/// Encrypt plaintext with XChaCha20-Poly1305.
///
/// Returns (nonce, ciphertext_with_tag).
pub fn encrypt(
    key: &SensitiveBytes32,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let nonce_bytes = generate_nonce();
    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let ciphertext = cipher(key)
        .encrypt(XNonce::from_slice(&nonce_bytes), payload)
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt a combined ciphertext_with_tag. Any failure is a tag mismatch.
pub fn decrypt(
    key: &SensitiveBytes32,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    cipher(key)
        .decrypt(XNonce::from_slice(nonce), payload)
        .map_err(|_| VaultError::AuthenticationTagMismatch)
}

/// Encrypt with a fresh nonce, returning the tag separately from the ciphertext.
pub fn seal_detached(key: &SensitiveBytes32, plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
    let nonce = generate_nonce();
    let mut buffer = plaintext.to_vec();

    let tag = cipher(key)
        .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Inverse of [`seal_detached`]. Nothing is returned unless the tag verifies.
pub fn open_detached(
    key: &SensitiveBytes32,
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let nonce: &[u8; NONCE_LEN] = nonce.try_into().map_err(|_| VaultError::InvalidKeyLength {
        what: "nonce",
        expected: NONCE_LEN,
        actual: nonce.len(),
    })?;
    if tag.len() != TAG_LEN {
        return Err(VaultError::InvalidKeyLength {
            what: "auth tag",
            expected: TAG_LEN,
            actual: tag.len(),
        });
    }

    let mut buffer = ciphertext.to_vec();
    cipher(key)
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            aad,
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| VaultError::AuthenticationTagMismatch)?;

    Ok(buffer)
}

/// Nonce fields come back from storage as plain byte vectors.
pub fn nonce_from_slice(bytes: &[u8]) -> Result<[u8; NONCE_LEN]> {
    bytes.try_into().map_err(|_| VaultError::InvalidKeyLength {
        what: "nonce",
        expected: NONCE_LEN,
        actual: bytes.len(),
    })
}
