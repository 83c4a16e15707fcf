/// BLAKE3 hashing utilities.
///
/// Every use goes through a hardcoded derive-key context so that checksums,
/// key derivation and fallback padding can never collide with each other.
use zeroize::Zeroize;

use crate::crypto::sensitive::{SensitiveBytes32, SensitiveVec};

/// Context for recovery secret fingerprints stored in a kit.
pub const SEED_HASH_CONTEXT: &str = "pqvault 2024-06 recovery secret hash v1";

/// Context for per-share checksums.
pub const SHARE_CHECKSUM_CONTEXT: &str = "pqvault 2024-06 recovery share checksum v1";

/// Derive 32 bytes from input keying material in BLAKE3 derive-key mode.
pub fn derive_key(context: &str, ikm: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, ikm)
}

/// Same as [`derive_key`] but wraps the output for automatic zeroization.
pub fn derive_secret(context: &str, ikm: &[u8]) -> SensitiveBytes32 {
    let mut out = derive_key(context, ikm);
    let secret = SensitiveBytes32::new(out);
    out.zeroize();
    secret
}

/// Derive an arbitrary-length output using the derive-key XOF.
pub fn derive_xof(context: &str, parts: &[&[u8]], len: usize) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let mut out = vec![0u8; len];
    hasher.finalize_xof().fill(&mut out);
    out
}

/// [`derive_xof`] for secret outputs.
pub fn derive_secret_xof(context: &str, parts: &[&[u8]], len: usize) -> SensitiveVec {
    SensitiveVec::new(derive_xof(context, parts, len))
}

/// Fingerprint of a recovery secret, compared in constant time after reconstruction.
pub fn seed_hash(secret: &[u8]) -> [u8; 32] {
    derive_key(SEED_HASH_CONTEXT, secret)
}

/// Constant-time equality for 32-byte digests.
pub fn digest_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    blake3::Hash::from(*a) == blake3::Hash::from(*b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_contexts_separate() {
        let k1 = derive_key("pqvault test context", b"input");
        assert_eq!(k1, derive_key("pqvault test context", b"input"));
        assert_ne!(k1, derive_key("different context", b"input"));
    }

    #[test]
    fn test_derive_xof_is_length_prefixed() {
        // "ab" + "c" and "a" + "bc" must not collide
        let a = derive_xof("ctx", &[b"ab", b"c"], 64);
        let b = derive_xof("ctx", &[b"a", b"bc"], 64);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_eq() {
        let d = seed_hash(b"secret");
        assert!(digest_eq(&d, &seed_hash(b"secret")));
        assert!(!digest_eq(&d, &seed_hash(b"other")));
    }
}
