/// Argon2id key derivation for passphrase-protected share files.
///
/// Production parameters: t=3, m=256MiB, p=4. Produces a 256-bit key.
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{Result, VaultError};

pub const SALT_LEN: usize = 32;

/// Argon2id cost parameters. Stored next to every share file so that files
/// written with older parameters stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub time_cost: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_kib: 262_144, // 256 MiB
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Reduced parameters for tests (fast but insecure).
    #[cfg(test)]
    pub fn insecure_for_tests() -> Self {
        Self {
            time_cost: 1,
            memory_kib: 1024,
            parallelism: 1,
        }
    }
}

/// Generate a random 32-byte salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte key from a passphrase using Argon2id.
pub fn derive_key(passphrase: &[u8], salt: &[u8], params: &KdfParams) -> Result<SensitiveBytes32> {
    let argon_params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;

    let key = SensitiveBytes32::new(output);
    zeroize::Zeroize::zeroize(&mut output);
    Ok(key)
}
