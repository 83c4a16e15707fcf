use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{algorithm} primitive unavailable: {reason}")]
    PrimitiveUnavailable {
        algorithm: &'static str,
        reason: String,
    },

    #[error("Key was produced by the {key} implementation, operation requires {expected}")]
    ImplementationMismatch {
        key: &'static str,
        expected: &'static str,
    },

    #[error("Authentication tag mismatch (ciphertext tampered or wrong key)")]
    AuthenticationTagMismatch,

    #[error("Insufficient shares: {valid} valid, {required} required")]
    InsufficientShares { valid: usize, required: usize },

    #[error("Checksum invalid for share {index}")]
    ShareChecksumInvalid { index: u8 },

    #[error("Invalid threshold {threshold} for {shares} shares")]
    InvalidThreshold { threshold: u8, shares: usize },

    #[error("Inconsistent shares: {0}")]
    InconsistentShares(String),

    #[error("Recovery kit {0} has expired")]
    RecoveryKitExpired(Uuid),

    #[error("Recovery kit {kit_id} is not active (status: {status})")]
    RecoveryKitInactive { kit_id: Uuid, status: String },

    #[error("Reconstructed secret does not match the recovery kit hash")]
    SecretMismatchAfterReconstruction,

    #[error("Guardian {0} has not been verified")]
    GuardianUnverified(Uuid),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Identity proof is outside the freshness window")]
    ProofExpired,

    #[error("Identity proof nonce has already been used")]
    ProofReplayed,

    #[error("Identity proof required for device {0}")]
    ProofRequired(String),

    #[error("Vault session expired or closed")]
    SessionExpired,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Entropy source failed: {0}")]
    Entropy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
