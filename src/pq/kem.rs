/// ML-KEM-768 key encapsulation with an X25519-based fallback.
///
/// `KeyEncapsulationService` owns one primary and one fallback backend. New
/// key pairs come from the primary unless the shared capability context has
/// marked it Unavailable. Existing keys always go back to the backend that
/// produced them.
use std::sync::Arc;

use ml_kem::kem::{Decapsulate as _, DecapsulationKey, EncapsulationKey};
use ml_kem::{B32, EncapsulateDeterministic as _, Encoded, EncodedSizeUser, KemCore, MlKem768, MlKem768Params};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::capability::CapabilityContext;
use super::{expect_len, Algorithm, Implementation, ML_KEM_768};
use crate::audit::{AuditEvent, AuditSink};
use crate::crypto::hash;
use crate::crypto::sensitive::{SensitiveBytes32, SensitiveVec};
use crate::error::{Result, VaultError};

const FALLBACK_SECRET_CONTEXT: &str = "pqvault 2024-06 fallback kem static secret v1";
const FALLBACK_PK_PAD_CONTEXT: &str = "pqvault 2024-06 fallback kem public key pad v1";
const FALLBACK_SK_PAD_CONTEXT: &str = "pqvault 2024-06 fallback kem secret key pad v1";
const FALLBACK_CT_PAD_CONTEXT: &str = "pqvault 2024-06 fallback kem ciphertext pad v1";
const FALLBACK_SS_CONTEXT: &str = "pqvault 2024-06 fallback kem shared secret v1";

const X25519_LEN: usize = 32;

/// A raw KEM implementation. Lengths are checked by the service, not here.
pub trait KemBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deterministic key pair from a 64-byte seed: `(public, secret)`.
    fn keypair(&self, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)>;

    /// `(ciphertext, shared_secret)`.
    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SensitiveVec)>;

    fn decapsulate(&self, ciphertext: &[u8], secret_key: &[u8]) -> Result<SensitiveVec>;
}

/// FIPS 203 ML-KEM-768 via the RustCrypto `ml-kem` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct MlKem768Backend;

impl MlKem768Backend {
    fn ek_from_bytes(public_key: &[u8]) -> Result<EncapsulationKey<MlKem768Params>> {
        let enc = Encoded::<EncapsulationKey<MlKem768Params>>::try_from(public_key).map_err(|_| {
            VaultError::InvalidKeyLength {
                what: "KEM public key",
                expected: ML_KEM_768.public_key_len,
                actual: public_key.len(),
            }
        })?;
        Ok(EncapsulationKey::from_bytes(&enc))
    }

    fn dk_from_bytes(secret_key: &[u8]) -> Result<DecapsulationKey<MlKem768Params>> {
        let enc = Encoded::<DecapsulationKey<MlKem768Params>>::try_from(secret_key).map_err(|_| {
            VaultError::InvalidKeyLength {
                what: "KEM secret key",
                expected: ML_KEM_768.secret_key_len,
                actual: secret_key.len(),
            }
        })?;
        Ok(DecapsulationKey::from_bytes(&enc))
    }
}

fn b32(bytes: &[u8]) -> Result<B32> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| VaultError::InvalidKeyLength {
        what: "KEM seed half",
        expected: 32,
        actual: bytes.len(),
    })?;
    Ok(B32::from(arr))
}

impl KemBackend for MlKem768Backend {
    fn name(&self) -> &'static str {
        "ml-kem"
    }

    fn keypair(&self, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
        expect_len("KEM seed", seed, ML_KEM_768.seed_len)?;
        let d = b32(&seed[..32])?;
        let z = b32(&seed[32..])?;
        let (dk, ek) = MlKem768::generate_deterministic(&d, &z);
        let mut sk = dk.as_bytes().as_slice().to_vec();
        let out = SensitiveVec::from_slice(&sk);
        sk.zeroize();
        Ok((ek.as_bytes().as_slice().to_vec(), out))
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
        let ek = Self::ek_from_bytes(public_key)?;
        let mut m = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut m);
        let result = ek.encapsulate_deterministic(&B32::from(m));
        m.zeroize();
        let (ct, ss) =
            result.map_err(|_| VaultError::Encryption("ML-KEM encapsulation failed".into()))?;
        let ct_bytes: &[u8] = ct.as_ref();
        Ok((ct_bytes.to_vec(), SensitiveVec::from_slice(ss.as_slice())))
    }

    fn decapsulate(&self, ciphertext: &[u8], secret_key: &[u8]) -> Result<SensitiveVec> {
        let dk = Self::dk_from_bytes(secret_key)?;
        let ct = ml_kem::Ciphertext::<MlKem768>::try_from(ciphertext).map_err(|_| {
            VaultError::InvalidKeyLength {
                what: "KEM ciphertext",
                expected: ML_KEM_768.ciphertext_len,
                actual: ciphertext.len(),
            }
        })?;
        let ss = dk
            .decapsulate(&ct)
            .map_err(|_| VaultError::Decryption("ML-KEM decapsulation failed".into()))?;
        Ok(SensitiveVec::from_slice(ss.as_slice()))
    }
}

/// X25519 expanded to the ML-KEM-768 byte layout.
///
/// ```text
/// public key : x25519_pk (32) || pad (1152)
/// secret key : x25519_sk (32) || public key (1184) || pad (1184)
/// ciphertext : ephemeral_pk (32) || pad (1056)
/// ```
///
/// Each pad is a BLAKE3 XOF of the leading X25519 value and is checked on
/// input. This only gives classical security.
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519FallbackKem;

impl X25519FallbackKem {
    fn public_pad(pk32: &[u8]) -> Vec<u8> {
        hash::derive_xof(
            FALLBACK_PK_PAD_CONTEXT,
            &[pk32],
            ML_KEM_768.public_key_len - X25519_LEN,
        )
    }

    fn secret_pad(pk32: &[u8]) -> Vec<u8> {
        hash::derive_xof(
            FALLBACK_SK_PAD_CONTEXT,
            &[pk32],
            ML_KEM_768.secret_key_len - X25519_LEN - ML_KEM_768.public_key_len,
        )
    }

    fn ciphertext_pad(eph32: &[u8]) -> Vec<u8> {
        hash::derive_xof(
            FALLBACK_CT_PAD_CONTEXT,
            &[eph32],
            ML_KEM_768.ciphertext_len - X25519_LEN,
        )
    }

    fn x25519_public(public_key: &[u8]) -> Result<[u8; 32]> {
        expect_len("KEM public key", public_key, ML_KEM_768.public_key_len)?;
        let (pk32, pad) = public_key.split_at(X25519_LEN);
        if pad != Self::public_pad(pk32).as_slice() {
            return Err(VaultError::Encryption("fallback public key padding mismatch".into()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(pk32);
        Ok(out)
    }

    fn shared_secret(dh: &[u8], eph32: &[u8], pk32: &[u8]) -> SensitiveVec {
        hash::derive_secret_xof(
            FALLBACK_SS_CONTEXT,
            &[dh, eph32, pk32],
            ML_KEM_768.shared_secret_len,
        )
    }
}

impl KemBackend for X25519FallbackKem {
    fn name(&self) -> &'static str {
        "x25519-expanded"
    }

    fn keypair(&self, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
        expect_len("KEM seed", seed, ML_KEM_768.seed_len)?;
        let secret = StaticSecret::from(hash::derive_key(FALLBACK_SECRET_CONTEXT, seed));
        let pk32 = PublicKey::from(&secret).to_bytes();

        let mut public_key = Vec::with_capacity(ML_KEM_768.public_key_len);
        public_key.extend_from_slice(&pk32);
        public_key.extend_from_slice(&Self::public_pad(&pk32));

        let mut sk = Vec::with_capacity(ML_KEM_768.secret_key_len);
        sk.extend_from_slice(secret.as_bytes());
        sk.extend_from_slice(&public_key);
        sk.extend_from_slice(&Self::secret_pad(&pk32));
        Ok((public_key, SensitiveVec::new(sk)))
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
        let pk32 = Self::x25519_public(public_key)?;
        let eph = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let eph_pk = PublicKey::from(&eph).to_bytes();
        let dh = eph.diffie_hellman(&PublicKey::from(pk32));
        if !dh.was_contributory() {
            return Err(VaultError::Encryption("non-contributory X25519 exchange".into()));
        }

        let mut ciphertext = Vec::with_capacity(ML_KEM_768.ciphertext_len);
        ciphertext.extend_from_slice(&eph_pk);
        ciphertext.extend_from_slice(&Self::ciphertext_pad(&eph_pk));
        let ss = Self::shared_secret(dh.as_bytes(), &eph_pk, &pk32);
        Ok((ciphertext, ss))
    }

    fn decapsulate(&self, ciphertext: &[u8], secret_key: &[u8]) -> Result<SensitiveVec> {
        expect_len("KEM ciphertext", ciphertext, ML_KEM_768.ciphertext_len)?;
        expect_len("KEM secret key", secret_key, ML_KEM_768.secret_key_len)?;

        let (secret32, rest) = secret_key.split_at(X25519_LEN);
        let (public_key, sk_pad) = rest.split_at(ML_KEM_768.public_key_len);
        let pk32 = Self::x25519_public(public_key)
            .map_err(|_| VaultError::Decryption("fallback secret key corrupted".into()))?;
        if sk_pad != Self::secret_pad(&pk32).as_slice() {
            return Err(VaultError::Decryption("fallback secret key corrupted".into()));
        }

        let (eph32, ct_pad) = ciphertext.split_at(X25519_LEN);
        if ct_pad != Self::ciphertext_pad(eph32).as_slice() {
            return Err(VaultError::Decryption("fallback ciphertext padding mismatch".into()));
        }

        let mut secret_bytes = [0u8; 32];
        secret_bytes.copy_from_slice(secret32);
        let secret = StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();

        let mut eph = [0u8; 32];
        eph.copy_from_slice(eph32);
        let dh = secret.diffie_hellman(&PublicKey::from(eph));
        if !dh.was_contributory() {
            return Err(VaultError::Decryption("non-contributory X25519 exchange".into()));
        }
        Ok(Self::shared_secret(dh.as_bytes(), eph32, &pk32))
    }
}

/// Encapsulation key tagged with the implementation that generated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemPublicKey {
    pub implementation: Implementation,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub bytes: Vec<u8>,
}

/// Decapsulation key. Zeroized on drop.
#[derive(Debug, Clone)]
pub struct KemSecretKey {
    pub implementation: Implementation,
    pub bytes: SensitiveVec,
}

#[derive(Debug, Clone)]
pub struct KemKeyPair {
    pub public_key: KemPublicKey,
    pub secret_key: KemSecretKey,
}

impl KemKeyPair {
    pub fn implementation(&self) -> Implementation {
        self.public_key.implementation
    }
}

#[derive(Debug)]
pub struct EncapsulationResult {
    pub implementation: Implementation,
    pub ciphertext: Vec<u8>,
    pub shared_secret: SensitiveBytes32,
}

pub struct KeyEncapsulationService {
    context: Arc<CapabilityContext>,
    primary: Arc<dyn KemBackend>,
    fallback: Arc<dyn KemBackend>,
    audit: Arc<dyn AuditSink>,
}

impl KeyEncapsulationService {
    pub fn new(context: Arc<CapabilityContext>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_primary(context, Arc::new(MlKem768Backend), audit)
    }

    /// Service with a custom primary backend; the fallback is always X25519.
    pub fn with_primary(
        context: Arc<CapabilityContext>,
        primary: Arc<dyn KemBackend>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            context,
            primary,
            fallback: Arc::new(X25519FallbackKem),
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
        self.context.snapshot().active_implementation(Algorithm::Kem)
    }

    fn backend(&self, implementation: Implementation) -> &dyn KemBackend {
        match implementation {
            Implementation::Primary => self.primary.as_ref(),
            Implementation::Fallback => self.fallback.as_ref(),
        }
    }

    fn unavailable(&self) -> VaultError {
        let reason = self
            .context
            .snapshot()
            .kem
            .reason
            .clone()
            .unwrap_or_else(|| "primary implementation disabled".into());
        VaultError::PrimitiveUnavailable {
            algorithm: Algorithm::Kem.name(),
            reason,
        }
    }

    /// Mark the primary Unavailable. Logs and audits only on the transition.
    pub fn demote(&self, reason: &str) {
        if self.context.mark_unavailable(Algorithm::Kem, reason) {
            info!(
                algorithm = Algorithm::Kem.name(),
                backend = self.primary.name(),
                reason,
                "Primary KEM unavailable, switching to fallback"
            );
            self.audit.record(AuditEvent::CapabilityFallback {
                algorithm: Algorithm::Kem,
                reason: reason.to_string(),
            });
        }
    }

    fn checked_keypair(backend: &dyn KemBackend, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
        let (pk, sk) = backend.keypair(seed)?;
        expect_len("KEM public key", &pk, ML_KEM_768.public_key_len)?;
        expect_len("KEM secret key", sk.as_bytes(), ML_KEM_768.secret_key_len)?;
        Ok((pk, sk))
    }

    fn checked_encapsulate(
        backend: &dyn KemBackend,
        public_key: &[u8],
    ) -> Result<(Vec<u8>, SensitiveBytes32)> {
        let (ct, ss) = backend.encapsulate(public_key)?;
        expect_len("KEM ciphertext", &ct, ML_KEM_768.ciphertext_len)?;
        let ss = SensitiveBytes32::from_slice(ss.as_bytes()).ok_or(VaultError::InvalidKeyLength {
            what: "KEM shared secret",
            expected: ML_KEM_768.shared_secret_len,
            actual: ss.len(),
        })?;
        Ok((ct, ss))
    }

    fn checked_decapsulate(
        backend: &dyn KemBackend,
        ciphertext: &[u8],
        secret_key: &[u8],
    ) -> Result<SensitiveBytes32> {
        let ss = backend.decapsulate(ciphertext, secret_key)?;
        SensitiveBytes32::from_slice(ss.as_bytes()).ok_or(VaultError::InvalidKeyLength {
            what: "KEM shared secret",
            expected: ML_KEM_768.shared_secret_len,
            actual: ss.len(),
        })
    }

    /// Key pair from a 64-byte seed (`d || z`).
    pub fn generate_key_pair(&self, seed: &[u8]) -> Result<KemKeyPair> {
        expect_len("KEM seed", seed, ML_KEM_768.seed_len)?;

        if self.context.snapshot().kem_usable() {
            match Self::checked_keypair(self.primary.as_ref(), seed) {
                Ok((pk, sk)) => {
                    self.context.mark_available(Algorithm::Kem);
                    return Ok(Self::tagged(Implementation::Primary, pk, sk));
                }
                Err(e) => self.demote(&format!("keypair: {e}")),
            }
        }

        let (pk, sk) = Self::checked_keypair(self.fallback.as_ref(), seed)?;
        debug!(backend = self.fallback.name(), "Generated fallback KEM key pair");
        Ok(Self::tagged(Implementation::Fallback, pk, sk))
    }

    fn tagged(implementation: Implementation, pk: Vec<u8>, sk: SensitiveVec) -> KemKeyPair {
        KemKeyPair {
            public_key: KemPublicKey {
                implementation,
                bytes: pk,
            },
            secret_key: KemSecretKey {
                implementation,
                bytes: sk,
            },
        }
    }

    pub fn encapsulate(&self, public_key: &KemPublicKey) -> Result<EncapsulationResult> {
        expect_len("KEM public key", &public_key.bytes, ML_KEM_768.public_key_len)?;
        let implementation = public_key.implementation;

        let (ciphertext, shared_secret) = match implementation {
            Implementation::Primary => {
                if !self.context.snapshot().kem_usable() {
                    return Err(self.unavailable());
                }
                match Self::checked_encapsulate(self.primary.as_ref(), &public_key.bytes) {
                    Ok(out) => {
                        self.context.mark_available(Algorithm::Kem);
                        out
                    }
                    Err(e) => {
                        self.demote(&format!("encapsulate: {e}"));
                        return Err(self.unavailable());
                    }
                }
            }
            Implementation::Fallback => {
                Self::checked_encapsulate(self.fallback.as_ref(), &public_key.bytes)?
            }
        };

        Ok(EncapsulationResult {
            implementation,
            ciphertext,
            shared_secret,
        })
    }

    pub fn decapsulate(&self, ciphertext: &[u8], secret_key: &KemSecretKey) -> Result<SensitiveBytes32> {
        expect_len("KEM ciphertext", ciphertext, ML_KEM_768.ciphertext_len)?;
        expect_len("KEM secret key", secret_key.bytes.as_bytes(), ML_KEM_768.secret_key_len)?;

        match secret_key.implementation {
            // Existing primary material is always opened with the primary, even
            // after a demotion; Unavailable only steers new keys and ciphertexts.
            Implementation::Primary => {
                match Self::checked_decapsulate(self.primary.as_ref(), ciphertext, secret_key.bytes.as_bytes()) {
                    Ok(ss) => {
                        self.context.mark_available(Algorithm::Kem);
                        Ok(ss)
                    }
                    Err(e) => {
                        self.demote(&format!("decapsulate: {e}"));
                        Err(self.unavailable())
                    }
                }
            }
            Implementation::Fallback => Self::checked_decapsulate(
                self.backend(Implementation::Fallback),
                ciphertext,
                secret_key.bytes.as_bytes(),
            ),
        }
    }

    /// Full round trip through the primary backend with scratch data.
    /// Does not touch the capability state.
    pub fn self_test(&self) -> std::result::Result<(), String> {
        let seed = [0x5Cu8; 64];
        let (pk, sk) = Self::checked_keypair(self.primary.as_ref(), &seed)
            .map_err(|e| format!("keypair: {e}"))?;
        let (ct, ss) = Self::checked_encapsulate(self.primary.as_ref(), &pk)
            .map_err(|e| format!("encapsulate: {e}"))?;
        let recovered = Self::checked_decapsulate(self.primary.as_ref(), &ct, sk.as_bytes())
            .map_err(|e| format!("decapsulate: {e}"))?;
        if !hash::digest_eq(ss.as_bytes(), recovered.as_bytes()) {
            return Err("shared secrets disagree".into());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::pq::capability::PrimitiveState;

    /// Real ML-KEM that emits ciphertexts one byte short.
    #[derive(Default)]
    pub(crate) struct WrongCiphertextKem {
        calls: AtomicUsize,
    }

    impl WrongCiphertextKem {
        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl KemBackend for WrongCiphertextKem {
        fn name(&self) -> &'static str {
            "short-ciphertext"
        }

        fn keypair(&self, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MlKem768Backend.keypair(seed)
        }

        fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (mut ct, ss) = MlKem768Backend.encapsulate(public_key)?;
            ct.pop();
            Ok((ct, ss))
        }

        fn decapsulate(&self, ciphertext: &[u8], secret_key: &[u8]) -> Result<SensitiveVec> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MlKem768Backend.decapsulate(ciphertext, secret_key)
        }
    }

    /// Healthy ML-KEM that counts calls.
    #[derive(Default)]
    pub(crate) struct CountingKem {
        calls: AtomicUsize,
    }

    impl CountingKem {
        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl KemBackend for CountingKem {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn keypair(&self, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MlKem768Backend.keypair(seed)
        }

        fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MlKem768Backend.encapsulate(public_key)
        }

        fn decapsulate(&self, ciphertext: &[u8], secret_key: &[u8]) -> Result<SensitiveVec> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MlKem768Backend.decapsulate(ciphertext, secret_key)
        }
    }

    /// Primary whose key generation returns a truncated public key.
    struct ShortKeyKem;

    impl KemBackend for ShortKeyKem {
        fn name(&self) -> &'static str {
            "short-key"
        }

        fn keypair(&self, seed: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
            let (mut pk, sk) = MlKem768Backend.keypair(seed)?;
            pk.truncate(1000);
            Ok((pk, sk))
        }

        fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SensitiveVec)> {
            MlKem768Backend.encapsulate(public_key)
        }

        fn decapsulate(&self, ciphertext: &[u8], secret_key: &[u8]) -> Result<SensitiveVec> {
            MlKem768Backend.decapsulate(ciphertext, secret_key)
        }
    }

    fn service() -> (KeyEncapsulationService, Arc<CapabilityContext>) {
        let context = Arc::new(CapabilityContext::default());
        let svc = KeyEncapsulationService::new(context.clone(), Arc::new(RecordingAuditSink::new()));
        (svc, context)
    }

    fn assert_sizes(kp: &KemKeyPair) {
        assert_eq!(kp.public_key.bytes.len(), 1184);
        assert_eq!(kp.secret_key.bytes.len(), 2400);
    }

    #[test]
    fn test_primary_round_trip() {
        let (svc, context) = service();
        let kp = svc.generate_key_pair(&[7u8; 64]).unwrap();
        assert_eq!(kp.implementation(), Implementation::Primary);
        assert_sizes(&kp);

        let enc = svc.encapsulate(&kp.public_key).unwrap();
        assert_eq!(enc.ciphertext.len(), 1088);
        let ss = svc.decapsulate(&enc.ciphertext, &kp.secret_key).unwrap();
        assert_eq!(ss.as_bytes(), enc.shared_secret.as_bytes());
        assert_eq!(context.state(Algorithm::Kem), PrimitiveState::Available);
    }

    #[test]
    fn test_keygen_is_deterministic() {
        let (svc, _) = service();
        let a = svc.generate_key_pair(&[1u8; 64]).unwrap();
        let b = svc.generate_key_pair(&[1u8; 64]).unwrap();
        let c = svc.generate_key_pair(&[2u8; 64]).unwrap();
        assert_eq!(a.public_key, b.public_key);
        assert_ne!(a.public_key, c.public_key);
    }

    #[test]
    fn test_fallback_round_trip_and_sizes() {
        let fallback = X25519FallbackKem;
        let (pk, sk) = fallback.keypair(&[9u8; 64]).unwrap();
        assert_eq!(pk.len(), 1184);
        assert_eq!(sk.len(), 2400);

        let (ct, ss) = fallback.encapsulate(&pk).unwrap();
        assert_eq!(ct.len(), 1088);
        assert_eq!(ss.len(), 32);
        assert_eq!(fallback.decapsulate(&ct, sk.as_bytes()).unwrap().as_bytes(), ss.as_bytes());
    }

    #[test]
    fn test_fallback_rejects_tampered_padding() {
        let fallback = X25519FallbackKem;
        let (mut pk, sk) = fallback.keypair(&[3u8; 64]).unwrap();
        let (mut ct, _) = fallback.encapsulate(&pk).unwrap();

        ct[500] ^= 1;
        assert!(fallback.decapsulate(&ct, sk.as_bytes()).is_err());

        pk[1000] ^= 1;
        assert!(fallback.encapsulate(&pk).is_err());
    }

    #[test]
    fn test_wrong_lengths_rejected() {
        let (svc, context) = service();
        assert!(matches!(
            svc.generate_key_pair(&[0u8; 32]),
            Err(VaultError::InvalidKeyLength { expected: 64, actual: 32, .. })
        ));

        let bad = KemPublicKey {
            implementation: Implementation::Primary,
            bytes: vec![0u8; 1183],
        };
        assert!(matches!(
            svc.encapsulate(&bad),
            Err(VaultError::InvalidKeyLength { expected: 1184, .. })
        ));

        let kp = svc.generate_key_pair(&[4u8; 64]).unwrap();
        assert!(matches!(
            svc.decapsulate(&[0u8; 100], &kp.secret_key),
            Err(VaultError::InvalidKeyLength { expected: 1088, .. })
        ));
        // Caller mistakes never demote the primary.
        assert_eq!(context.snapshot().fallback_transitions, 0);
    }

    #[test]
    fn test_wrong_ciphertext_length_triggers_exactly_one_fallback() {
        let context = Arc::new(CapabilityContext::default());
        let audit = Arc::new(RecordingAuditSink::new());
        let broken = Arc::new(WrongCiphertextKem::default());
        let svc = KeyEncapsulationService::with_primary(context.clone(), broken.clone(), audit.clone());

        let primary_kp = svc.generate_key_pair(&[5u8; 64]).unwrap();
        assert_eq!(primary_kp.implementation(), Implementation::Primary);

        let err = svc.encapsulate(&primary_kp.public_key).unwrap_err();
        assert!(matches!(err, VaultError::PrimitiveUnavailable { .. }));
        assert_eq!(context.state(Algorithm::Kem), PrimitiveState::Unavailable);
        assert_eq!(svc.active_implementation(), Implementation::Fallback);

        let calls = broken.calls();
        let kp = svc.generate_key_pair(&[6u8; 64]).unwrap();
        assert_eq!(kp.implementation(), Implementation::Fallback);
        assert_sizes(&kp);
        let enc = svc.encapsulate(&kp.public_key).unwrap();
        assert_eq!(enc.implementation, Implementation::Fallback);
        assert_eq!(
            svc.decapsulate(&enc.ciphertext, &kp.secret_key).unwrap().as_bytes(),
            enc.shared_secret.as_bytes()
        );

        // Primary-tagged keys now fail without touching the primary.
        assert!(matches!(
            svc.encapsulate(&primary_kp.public_key),
            Err(VaultError::PrimitiveUnavailable { .. })
        ));
        assert_eq!(broken.calls(), calls, "primary must not be attempted again");

        // Ciphertexts made before the demotion still open under the primary key.
        let (old_ct, old_ss) = MlKem768Backend.encapsulate(&primary_kp.public_key.bytes).unwrap();
        let ss = svc.decapsulate(&old_ct, &primary_kp.secret_key).unwrap();
        assert_eq!(ss.as_bytes(), old_ss.as_bytes());

        assert_eq!(context.snapshot().fallback_transitions, 1);
        let fallbacks = audit
            .events()
            .into_iter()
            .filter(|e| matches!(e, AuditEvent::CapabilityFallback { .. }))
            .count();
        assert_eq!(fallbacks, 1);
    }

    #[test]
    fn test_short_primary_key_falls_back_during_keygen() {
        let context = Arc::new(CapabilityContext::default());
        let svc = KeyEncapsulationService::with_primary(
            context.clone(),
            Arc::new(ShortKeyKem),
            Arc::new(RecordingAuditSink::new()),
        );

        let kp = svc.generate_key_pair(&[8u8; 64]).unwrap();
        assert_eq!(kp.implementation(), Implementation::Fallback);
        assert_sizes(&kp);
        assert_eq!(context.state(Algorithm::Kem), PrimitiveState::Unavailable);

        context.reset(Algorithm::Kem);
        assert_eq!(svc.active_implementation(), Implementation::Primary);
    }

    #[test]
    fn test_self_test_reports_broken_primary() {
        let context = Arc::new(CapabilityContext::default());
        let audit: Arc<dyn AuditSink> = Arc::new(RecordingAuditSink::new());
        let healthy = KeyEncapsulationService::new(context.clone(), audit.clone());
        assert!(healthy.self_test().is_ok());

        let broken = KeyEncapsulationService::with_primary(
            context.clone(),
            Arc::new(WrongCiphertextKem::default()),
            audit,
        );
        let reason = broken.self_test().unwrap_err();
        assert!(reason.starts_with("encapsulate"));
        assert_eq!(context.state(Algorithm::Kem), PrimitiveState::Untested);
    }

    #[test]
    fn test_public_key_serializes_as_hex() {
        let (svc, _) = service();
        let kp = svc.generate_key_pair(&[2u8; 64]).unwrap();
        let json = serde_json::to_string(&kp.public_key).unwrap();
        let back: KemPublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kp.public_key);
        assert!(json.contains("\"primary\""));
    }
}
