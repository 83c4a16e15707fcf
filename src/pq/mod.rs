/// Post-quantum primitives with runtime capability fallback.
///
/// Each algorithm has two implementations:
/// - `Primary`: the real ML-KEM-768 / ML-DSA-65 (FIPS 203 / FIPS 204)
/// - `Fallback`: X25519 / Ed25519 expanded to the same byte sizes
///
/// The two are not interoperable. Every key, ciphertext and signature is
/// tagged with the implementation that produced it and is only ever used with
/// that implementation again. Which implementation new keys come from is
/// decided by the shared [`capability::CapabilityContext`].
pub mod capability;
pub mod kem;
pub mod proof;
pub mod sign;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

pub use capability::{CapabilityContext, CapabilityProbe, CapabilityReport, CapabilitySet};
pub use kem::{EncapsulationResult, KemKeyPair, KemPublicKey, KemSecretKey, KeyEncapsulationService};
pub use proof::{create_proof, create_proof_at, IdentityProof, ProofVerifier};
pub use sign::{DsaKeyPair, DsaPublicKey, DsaSecretKey, DsaSignature, SignatureService};

/// The two algorithm families the vault depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "ML-KEM-768")]
    Kem,
    #[serde(rename = "ML-DSA-65")]
    Dsa,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Kem => "ML-KEM-768",
            Algorithm::Dsa => "ML-DSA-65",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which of the two implementations produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Implementation {
    Primary,
    Fallback,
}

impl Implementation {
    pub fn name(self) -> &'static str {
        match self {
            Implementation::Primary => "primary",
            Implementation::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed byte sizes for ML-KEM-768.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KemParams {
    pub public_key_len: usize,
    pub secret_key_len: usize,
    pub ciphertext_len: usize,
    pub shared_secret_len: usize,
    /// `d || z` for deterministic key generation.
    pub seed_len: usize,
}

pub const ML_KEM_768: KemParams = KemParams {
    public_key_len: 1184,
    secret_key_len: 2400,
    ciphertext_len: 1088,
    shared_secret_len: 32,
    seed_len: 64,
};

/// Fixed byte sizes for ML-DSA-65.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DsaParams {
    pub public_key_len: usize,
    pub secret_key_len: usize,
    pub signature_len: usize,
    pub seed_len: usize,
}

pub const ML_DSA_65: DsaParams = DsaParams {
    public_key_len: 1952,
    secret_key_len: 4032,
    signature_len: 3309,
    seed_len: 32,
};

/// Reject any value whose length differs from the algorithm constant.
pub(crate) fn expect_len(what: &'static str, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(VaultError::InvalidKeyLength {
            what,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}
