/// ML-DSA-65 signatures with an Ed25519-based fallback.
///
/// Same contract as the KEM service: new keys come from the primary while it
/// is usable, existing keys and signatures go back to the implementation they
/// are tagged with.
use std::sync::Arc;

use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use ml_dsa::signature::Verifier as _;
use ml_dsa::{KeyGen as _, MlDsa65, Signature as MlDsaSig, SigningKey as MlDsaSk, VerifyingKey as MlDsaVk};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use super::capability::CapabilityContext;
use super::{expect_len, Algorithm, Implementation, ML_DSA_65};
use crate::audit::{AuditEvent, AuditSink};
use crate::crypto::hash;
use crate::crypto::sensitive::SensitiveVec;
use crate::error::{Result, VaultError};

const FALLBACK_SIGNING_CONTEXT: &str = "pqvault 2024-06 fallback dsa signing key v1";
const FALLBACK_PK_PAD_CONTEXT: &str = "pqvault 2024-06 fallback dsa public key pad v1";
const FALLBACK_SK_PAD_CONTEXT: &str = "pqvault 2024-06 fallback dsa secret key pad v1";
const FALLBACK_SIG_PAD_CONTEXT: &str = "pqvault 2024-06 fallback dsa signature pad v1";

const ED25519_KEY_LEN: usize = 32;
const ED25519_SIG_LEN: usize = 64;

pub trait DsaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deterministic key pair from a 32-byte seed: `(public, secret)`.
    fn keypair(&self, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)>;

    fn sign(&self, message: &[u8], secret_key: &[u8]) -> Result<Vec<u8>>;

    /// `Ok(false)` for a well-formed input that does not verify.
    fn verify(&self, signature: &[u8], message: &[u8], public_key: &[u8]) -> Result<bool>;
}

/// FIPS 204 ML-DSA-65 via the RustCrypto `ml-dsa` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct MlDsa65Backend;

impl DsaBackend for MlDsa65Backend {
    fn name(&self) -> &'static str {
        "ml-dsa"
    }

    fn keypair(&self, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
        let mut rng_seed: [u8; 32] = seed.try_into().map_err(|_| VaultError::InvalidKeyLength {
            what: "DSA seed",
            expected: ML_DSA_65.seed_len,
            actual: seed.len(),
        })?;
        let mut rng = ChaCha20Rng::from_seed(rng_seed);
        rng_seed.zeroize();

        let kp = MlDsa65::key_gen(&mut rng);
        let sk = SensitiveVec::from_slice(kp.signing_key().encode().as_slice());
        let pk = kp.verifying_key().encode().as_slice().to_vec();
        Ok((pk, sk))
    }

    fn sign(&self, message: &[u8], secret_key: &[u8]) -> Result<Vec<u8>> {
        let enc = ml_dsa::EncodedSigningKey::<MlDsa65>::try_from(secret_key).map_err(|_| {
            VaultError::InvalidKeyLength {
                what: "DSA secret key",
                expected: ML_DSA_65.secret_key_len,
                actual: secret_key.len(),
            }
        })?;
        let sk = MlDsaSk::<MlDsa65>::decode(&enc);
        let sig = sk.sign(message);
        Ok(sig.encode().as_slice().to_vec())
    }

    fn verify(&self, signature: &[u8], message: &[u8], public_key: &[u8]) -> Result<bool> {
        let enc = ml_dsa::EncodedVerifyingKey::<MlDsa65>::try_from(public_key).map_err(|_| {
            VaultError::InvalidKeyLength {
                what: "DSA public key",
                expected: ML_DSA_65.public_key_len,
                actual: public_key.len(),
            }
        })?;
        let vk = MlDsaVk::<MlDsa65>::decode(&enc);
        let Ok(sig) = MlDsaSig::<MlDsa65>::try_from(signature) else {
            return Ok(false);
        };
        Ok(vk.verify(message, &sig).is_ok())
    }
}

/// Ed25519 expanded to the ML-DSA-65 byte layout.
///
/// ```text
/// public key : ed25519_vk (32) || pad (1920)
/// secret key : ed25519_sk (32) || public key (1952) || pad (2048)
/// signature  : ed25519_sig (64) || pad (3245)
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519FallbackDsa;

impl Ed25519FallbackDsa {
    fn public_pad(vk32: &[u8]) -> Vec<u8> {
        hash::derive_xof(
            FALLBACK_PK_PAD_CONTEXT,
            &[vk32],
            ML_DSA_65.public_key_len - ED25519_KEY_LEN,
        )
    }

    fn secret_pad(vk32: &[u8]) -> Vec<u8> {
        hash::derive_xof(
            FALLBACK_SK_PAD_CONTEXT,
            &[vk32],
            ML_DSA_65.secret_key_len - ED25519_KEY_LEN - ML_DSA_65.public_key_len,
        )
    }

    fn signature_pad(sig64: &[u8]) -> Vec<u8> {
        hash::derive_xof(
            FALLBACK_SIG_PAD_CONTEXT,
            &[sig64],
            ML_DSA_65.signature_len - ED25519_SIG_LEN,
        )
    }

    fn verifying_key(public_key: &[u8]) -> Result<VerifyingKey> {
        expect_len("DSA public key", public_key, ML_DSA_65.public_key_len)?;
        let (vk32, pad) = public_key.split_at(ED25519_KEY_LEN);
        if pad != Self::public_pad(vk32).as_slice() {
            return Err(VaultError::SignatureVerification);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(vk32);
        VerifyingKey::from_bytes(&bytes).map_err(|_| VaultError::SignatureVerification)
    }
}

impl DsaBackend for Ed25519FallbackDsa {
    fn name(&self) -> &'static str {
        "ed25519-expanded"
    }

    fn keypair(&self, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
        expect_len("DSA seed", seed, ML_DSA_65.seed_len)?;
        let mut key_bytes = hash::derive_key(FALLBACK_SIGNING_CONTEXT, seed);
        let signing = SigningKey::from_bytes(&key_bytes);
        key_bytes.zeroize();
        let vk32 = signing.verifying_key().to_bytes();

        let mut public_key = Vec::with_capacity(ML_DSA_65.public_key_len);
        public_key.extend_from_slice(&vk32);
        public_key.extend_from_slice(&Self::public_pad(&vk32));

        let mut sk = Vec::with_capacity(ML_DSA_65.secret_key_len);
        sk.extend_from_slice(signing.as_bytes());
        sk.extend_from_slice(&public_key);
        sk.extend_from_slice(&Self::secret_pad(&vk32));
        Ok((public_key, SensitiveVec::new(sk)))
    }

    fn sign(&self, message: &[u8], secret_key: &[u8]) -> Result<Vec<u8>> {
        expect_len("DSA secret key", secret_key, ML_DSA_65.secret_key_len)?;
        let (key32, rest) = secret_key.split_at(ED25519_KEY_LEN);
        let (public_key, sk_pad) = rest.split_at(ML_DSA_65.public_key_len);
        let vk = Self::verifying_key(public_key)
            .map_err(|_| VaultError::KeyDerivation("fallback DSA secret key corrupted".into()))?;
        if sk_pad != Self::secret_pad(vk.as_bytes()).as_slice() {
            return Err(VaultError::KeyDerivation("fallback DSA secret key corrupted".into()));
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(key32);
        let signing = SigningKey::from_bytes(&key_bytes);
        key_bytes.zeroize();
        if signing.verifying_key() != vk {
            return Err(VaultError::KeyDerivation("fallback DSA key halves disagree".into()));
        }

        let sig64 = signing.sign(message).to_bytes();
        let mut signature = Vec::with_capacity(ML_DSA_65.signature_len);
        signature.extend_from_slice(&sig64);
        signature.extend_from_slice(&Self::signature_pad(&sig64));
        Ok(signature)
    }

    fn verify(&self, signature: &[u8], message: &[u8], public_key: &[u8]) -> Result<bool> {
        expect_len("DSA signature", signature, ML_DSA_65.signature_len)?;
        let Ok(vk) = Self::verifying_key(public_key) else {
            return Ok(false);
        };
        let (sig64, pad) = signature.split_at(ED25519_SIG_LEN);
        if pad != Self::signature_pad(sig64).as_slice() {
            return Ok(false);
        }
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(sig64);
        let sig = ed25519_dalek::Signature::from_bytes(&bytes);
        Ok(vk.verify_strict(message, &sig).is_ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsaPublicKey {
    pub implementation: Implementation,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DsaSecretKey {
    pub implementation: Implementation,
    pub bytes: SensitiveVec,
}

#[derive(Debug, Clone)]
pub struct DsaKeyPair {
    pub public_key: DsaPublicKey,
    pub secret_key: DsaSecretKey,
}

impl DsaKeyPair {
    pub fn implementation(&self) -> Implementation {
        self.public_key.implementation
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsaSignature {
    pub implementation: Implementation,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub bytes: Vec<u8>,
}

pub struct SignatureService {
    context: Arc<CapabilityContext>,
    primary: Arc<dyn DsaBackend>,
    fallback: Arc<dyn DsaBackend>,
    audit: Arc<dyn AuditSink>,
}

impl SignatureService {
    pub fn new(context: Arc<CapabilityContext>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_primary(context, Arc::new(MlDsa65Backend), audit)
    }

    pub fn with_primary(
        context: Arc<CapabilityContext>,
        primary: Arc<dyn DsaBackend>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            context,
            primary,
            fallback: Arc::new(Ed25519FallbackDsa),
            audit,
        }
    }

    pub fn primary_name(&self) -> &'static str {
        self.primary.name()
    }

    pub fn fallback_name(&self) -> &'static str {
        self.fallback.name()
    }

    pub fn active_implementation(&self) -> Implementation {
        self.context.snapshot().active_implementation(Algorithm::Dsa)
    }

    fn unavailable(&self) -> VaultError {
        let reason = self
            .context
            .snapshot()
            .dsa
            .reason
            .clone()
            .unwrap_or_else(|| "primary implementation disabled".into());
        VaultError::PrimitiveUnavailable {
            algorithm: Algorithm::Dsa.name(),
            reason,
        }
    }

    pub fn demote(&self, reason: &str) {
        if self.context.mark_unavailable(Algorithm::Dsa, reason) {
            info!(
                algorithm = Algorithm::Dsa.name(),
                backend = self.primary.name(),
                reason,
                "Primary DSA unavailable, switching to fallback"
            );
            self.audit.record(AuditEvent::CapabilityFallback {
                algorithm: Algorithm::Dsa,
                reason: reason.to_string(),
            });
        }
    }

    fn checked_keypair(backend: &dyn DsaBackend, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
        let (pk, sk) = backend.keypair(seed)?;
        expect_len("DSA public key", &pk, ML_DSA_65.public_key_len)?;
        expect_len("DSA secret key", sk.as_bytes(), ML_DSA_65.secret_key_len)?;
        Ok((pk, sk))
    }

    fn checked_sign(backend: &dyn DsaBackend, message: &[u8], secret_key: &[u8]) -> Result<Vec<u8>> {
        let sig = backend.sign(message, secret_key)?;
        expect_len("DSA signature", &sig, ML_DSA_65.signature_len)?;
        Ok(sig)
    }

    /// Key pair from a 32-byte seed.
    pub fn generate_key_pair(&self, seed: &[u8]) -> Result<DsaKeyPair> {
        expect_len("DSA seed", seed, ML_DSA_65.seed_len)?;

        if self.context.snapshot().dsa_usable() {
            match Self::checked_keypair(self.primary.as_ref(), seed) {
                Ok((pk, sk)) => {
                    self.context.mark_available(Algorithm::Dsa);
                    return Ok(Self::tagged(Implementation::Primary, pk, sk));
                }
                Err(e) => self.demote(&format!("keypair: {e}")),
            }
        }

        let (pk, sk) = Self::checked_keypair(self.fallback.as_ref(), seed)?;
        debug!(backend = self.fallback.name(), "Generated fallback DSA key pair");
        Ok(Self::tagged(Implementation::Fallback, pk, sk))
    }

    fn tagged(implementation: Implementation, pk: Vec<u8>, sk: SensitiveVec) -> DsaKeyPair {
        DsaKeyPair {
            public_key: DsaPublicKey {
                implementation,
                bytes: pk,
            },
            secret_key: DsaSecretKey {
                implementation,
                bytes: sk,
            },
        }
    }

    pub fn sign(&self, message: &[u8], secret_key: &DsaSecretKey) -> Result<DsaSignature> {
        expect_len("DSA secret key", secret_key.bytes.as_bytes(), ML_DSA_65.secret_key_len)?;
        let implementation = secret_key.implementation;

        let bytes = match implementation {
            Implementation::Primary => {
                if !self.context.snapshot().dsa_usable() {
                    return Err(self.unavailable());
                }
                match Self::checked_sign(self.primary.as_ref(), message, secret_key.bytes.as_bytes()) {
                    Ok(sig) => {
                        self.context.mark_available(Algorithm::Dsa);
                        sig
                    }
                    Err(e) => {
                        self.demote(&format!("sign: {e}"));
                        return Err(self.unavailable());
                    }
                }
            }
            Implementation::Fallback => {
                Self::checked_sign(self.fallback.as_ref(), message, secret_key.bytes.as_bytes())?
            }
        };

        Ok(DsaSignature {
            implementation,
            bytes,
        })
    }

    /// `Ok(())` only for a valid signature by `public_key` over `message`.
    pub fn verify(
        &self,
        signature: &DsaSignature,
        message: &[u8],
        public_key: &DsaPublicKey,
    ) -> Result<()> {
        expect_len("DSA public key", &public_key.bytes, ML_DSA_65.public_key_len)?;
        expect_len("DSA signature", &signature.bytes, ML_DSA_65.signature_len)?;
        if signature.implementation != public_key.implementation {
            return Err(VaultError::ImplementationMismatch {
                key: public_key.implementation.name(),
                expected: signature.implementation.name(),
            });
        }

        let valid = match public_key.implementation {
            // Signatures already issued under the primary stay verifiable after a demotion.
            Implementation::Primary => {
                match self.primary.verify(&signature.bytes, message, &public_key.bytes) {
                    Ok(valid) => valid,
                    Err(e) => {
                        self.demote(&format!("verify: {e}"));
                        return Err(self.unavailable());
                    }
                }
            }
            Implementation::Fallback => {
                self.fallback.verify(&signature.bytes, message, &public_key.bytes)?
            }
        };

        if valid {
            Ok(())
        } else {
            Err(VaultError::SignatureVerification)
        }
    }

    /// Keygen, sign, verify and a negative verify through the primary backend.
    /// Does not touch the capability state.
    pub fn self_test(&self) -> std::result::Result<(), String> {
        let message = b"pqvault capability probe";
        let (pk, sk) = Self::checked_keypair(self.primary.as_ref(), &[0xA5u8; 32])
            .map_err(|e| format!("keypair: {e}"))?;
        let sig = Self::checked_sign(self.primary.as_ref(), message, sk.as_bytes())
            .map_err(|e| format!("sign: {e}"))?;

        match self.primary.verify(&sig, message, &pk) {
            Ok(true) => {}
            Ok(false) => return Err("verify: valid signature rejected".into()),
            Err(e) => return Err(format!("verify: {e}")),
        }
        match self.primary.verify(&sig, b"different message", &pk) {
            Ok(false) => Ok(()),
            Ok(true) => Err("verify: forged message accepted".into()),
            Err(e) => Err(format!("verify: {e}")),
        }
    }
}
