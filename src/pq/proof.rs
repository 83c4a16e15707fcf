/// Signed, timestamped, nonce-bound proofs of device identity.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::sign::{DsaPublicKey, DsaSecretKey, DsaSignature, SignatureService};
use crate::error::{Result, VaultError};

const PROOF_DOMAIN: &[u8] = b"pqvault-identity-proof-v1";

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(300);
pub const DEFAULT_FUTURE_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProof {
    pub device_id: String,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub nonce: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub signature: DsaSignature,
}

impl IdentityProof {
    /// Bytes covered by the signature.
    pub fn signed_message(device_id: &str, nonce: &[u8], issued_at: DateTime<Utc>) -> Vec<u8> {
        let mut msg = Vec::with_capacity(PROOF_DOMAIN.len() + device_id.len() + nonce.len() + 24);
        msg.extend_from_slice(PROOF_DOMAIN);
        msg.extend_from_slice(&(device_id.len() as u32).to_be_bytes());
        msg.extend_from_slice(device_id.as_bytes());
        msg.extend_from_slice(&(nonce.len() as u32).to_be_bytes());
        msg.extend_from_slice(nonce);
        msg.extend_from_slice(&issued_at.timestamp_millis().to_be_bytes());
        msg
    }
}

pub fn create_proof(
    signer: &SignatureService,
    device_id: &str,
    secret_key: &DsaSecretKey,
    nonce: &[u8],
) -> Result<IdentityProof> {
    create_proof_at(signer, device_id, secret_key, nonce, Utc::now())
}

pub fn create_proof_at(
    signer: &SignatureService,
    device_id: &str,
    secret_key: &DsaSecretKey,
    nonce: &[u8],
    issued_at: DateTime<Utc>,
) -> Result<IdentityProof> {
    let message = IdentityProof::signed_message(device_id, nonce, issued_at);
    let signature = signer.sign(&message, secret_key)?;
    Ok(IdentityProof {
        device_id: device_id.to_string(),
        nonce: nonce.to_vec(),
        issued_at,
        signature,
    })
}

/// Checks signature, freshness and nonce reuse.
pub struct ProofVerifier {
    signatures: Arc<SignatureService>,
    freshness: chrono::Duration,
    future_skew: chrono::Duration,
    seen: Mutex<HashMap<Vec<u8>, DateTime<Utc>>>,
}

impl ProofVerifier {
    pub fn new(signatures: Arc<SignatureService>, freshness: Duration, future_skew: Duration) -> Self {
        Self {
            signatures,
            freshness: chrono::Duration::from_std(freshness).unwrap_or(chrono::Duration::MAX),
            future_skew: chrono::Duration::from_std(future_skew).unwrap_or(chrono::Duration::MAX),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults(signatures: Arc<SignatureService>) -> Self {
        Self::new(signatures, DEFAULT_FRESHNESS, DEFAULT_FUTURE_SKEW)
    }

    pub fn verify(&self, proof: &IdentityProof, public_key: &DsaPublicKey) -> Result<()> {
        self.verify_at(proof, public_key, Utc::now())
    }

    /// Nonces are only recorded after the signature and timestamp pass, so
    /// forged proofs cannot burn a legitimate nonce.
    pub fn verify_at(
        &self,
        proof: &IdentityProof,
        public_key: &DsaPublicKey,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let message = IdentityProof::signed_message(&proof.device_id, &proof.nonce, proof.issued_at);
        self.signatures.verify(&proof.signature, &message, public_key)?;

        let age = now.signed_duration_since(proof.issued_at);
        if age > self.freshness || -age > self.future_skew {
            debug!(device_id = %proof.device_id, issued_at = %proof.issued_at, "Stale identity proof");
            return Err(VaultError::ProofExpired);
        }

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let horizon = self
            .freshness
            .checked_add(&self.future_skew)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        seen.retain(|_, issued| *issued >= horizon);
        if seen.contains_key(&proof.nonce) {
            return Err(VaultError::ProofReplayed);
        }
        seen.insert(proof.nonce.clone(), proof.issued_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::pq::capability::CapabilityContext;
    use crate::pq::sign::DsaKeyPair;

    fn setup() -> (Arc<SignatureService>, DsaKeyPair, ProofVerifier) {
        let svc = Arc::new(SignatureService::new(
            Arc::new(CapabilityContext::default()),
            Arc::new(RecordingAuditSink::new()),
        ));
        let kp = svc.generate_key_pair(&[11u8; 32]).unwrap();
        let verifier = ProofVerifier::with_defaults(svc.clone());
        (svc, kp, verifier)
    }

    #[test]
    fn test_fresh_proof_accepted_once() {
        let (svc, kp, verifier) = setup();
        let proof = create_proof(&svc, "device-1", &kp.secret_key, &[1u8; 16]).unwrap();

        verifier.verify(&proof, &kp.public_key).unwrap();
        assert!(matches!(
            verifier.verify(&proof, &kp.public_key),
            Err(VaultError::ProofReplayed)
        ));
    }

    #[test]
    fn test_stale_and_future_proofs_rejected() {
        let (svc, kp, verifier) = setup();
        let now = Utc::now();

        let old = create_proof_at(&svc, "d", &kp.secret_key, &[2u8; 16], now - chrono::Duration::minutes(6)).unwrap();
        assert!(matches!(
            verifier.verify_at(&old, &kp.public_key, now),
            Err(VaultError::ProofExpired)
        ));

        let future = create_proof_at(&svc, "d", &kp.secret_key, &[3u8; 16], now + chrono::Duration::minutes(2)).unwrap();
        assert!(matches!(
            verifier.verify_at(&future, &kp.public_key, now),
            Err(VaultError::ProofExpired)
        ));

        let skewed = create_proof_at(&svc, "d", &kp.secret_key, &[4u8; 16], now + chrono::Duration::seconds(10)).unwrap();
        verifier.verify_at(&skewed, &kp.public_key, now).unwrap();
    }

    #[test]
    fn test_tampered_proof_rejected_without_burning_nonce() {
        let (svc, kp, verifier) = setup();
        let proof = create_proof(&svc, "device-1", &kp.secret_key, &[5u8; 16]).unwrap();

        let mut forged = proof.clone();
        forged.device_id = "device-2".into();
        assert!(matches!(
            verifier.verify(&forged, &kp.public_key),
            Err(VaultError::SignatureVerification)
        ));

        verifier.verify(&proof, &kp.public_key).unwrap();
    }

    #[test]
    fn test_nonce_forgotten_after_window() {
        let (svc, kp, verifier) = setup();
        let t0 = Utc::now();
        let first = create_proof_at(&svc, "d", &kp.secret_key, &[6u8; 16], t0).unwrap();
        verifier.verify_at(&first, &kp.public_key, t0).unwrap();

        let t1 = t0 + chrono::Duration::minutes(10);
        let second = create_proof_at(&svc, "d", &kp.secret_key, &[6u8; 16], t1).unwrap();
        verifier.verify_at(&second, &kp.public_key, t1).unwrap();
    }

    #[test]
    fn test_huge_window_does_not_overflow() {
        let (svc, kp, _) = setup();
        let ages = Duration::from_secs(300_000 * 365 * 86_400);
        let verifier = ProofVerifier::new(svc.clone(), ages, Duration::from_secs(u64::MAX));

        let proof = create_proof(&svc, "d", &kp.secret_key, &[7u8; 16]).unwrap();
        verifier.verify(&proof, &kp.public_key).unwrap();
        assert!(matches!(
            verifier.verify(&proof, &kp.public_key),
            Err(VaultError::ProofReplayed)
        ));
    }
}
