/// Envelope encryption of the vault master key, one wrap per device.
///
/// Wrapping a master key for a device:
/// 1. KEM-encapsulate to the device's public key
/// 2. Derive an AEAD key from the shared secret (BLAKE3 derive-key)
/// 3. XChaCha20-Poly1305 encrypt the 32-byte master key, AAD bound to the device id
///
/// Only the device holding the matching KEM secret key can reverse this.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::crypto::{aead, hash, sensitive::SensitiveBytes32};
use crate::error::{Result, VaultError};
use crate::pq::kem::{KemPublicKey, KemSecretKey, KeyEncapsulationService};
use crate::pq::proof::{IdentityProof, ProofVerifier};
use crate::pq::sign::DsaPublicKey;
use crate::pq::Implementation;
use crate::storage::{self, BlobStore};

const WRAP_KEY_CONTEXT: &str = "pqvault 2024-06 master key wrap v1";
const WRAP_AAD_DOMAIN: &[u8] = b"pqvault-master-key-wrap-v1:";

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// The symmetric root of a user's vault. Zeroized on drop.
#[derive(Clone, Debug)]
pub struct MasterKey(SensitiveBytes32);

impl MasterKey {
    pub fn generate() -> Self {
        Self(aead::generate_key())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(SensitiveBytes32::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        SensitiveBytes32::from_slice(bytes)
            .map(Self)
            .ok_or(VaultError::InvalidKeyLength {
                what: "master key",
                expected: aead::KEY_LEN,
                actual: bytes.len(),
            })
    }

    pub fn key(&self) -> &SensitiveBytes32 {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// A device whose WebAuthn ceremony has already succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_id: String,
    pub kem_public_key: KemPublicKey,
    #[serde(default)]
    pub dsa_public_key: Option<DsaPublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedMasterKey {
    pub device_id: String,
    pub user_id: String,
    pub implementation: Implementation,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub kem_ciphertext: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub auth_tag: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

fn wrap_key(key: &str) -> String {
    format!("wrap/{key}")
}

fn wrap_aad(device_id: &str) -> Vec<u8> {
    let mut aad = WRAP_AAD_DOMAIN.to_vec();
    aad.extend_from_slice(device_id.as_bytes());
    aad
}

/// Unwrapped master key with a bounded lifetime.
#[derive(Debug)]
pub struct VaultSession {
    device_id: String,
    master_key: Option<MasterKey>,
    expires_at: DateTime<Utc>,
}

impl VaultSession {
    pub fn new(device_id: String, master_key: MasterKey, ttl: Duration) -> Result<Self> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| VaultError::Config(format!("session ttl {ttl:?} is out of range")))?;
        Ok(Self {
            device_id,
            master_key: Some(master_key),
            expires_at,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_open(&self) -> bool {
        self.master_key.is_some() && Utc::now() < self.expires_at
    }

    /// The master key, unless the session expired or was closed. The first
    /// access after expiry drops the key.
    pub fn master_key(&mut self) -> Result<&MasterKey> {
        if Utc::now() >= self.expires_at {
            self.master_key = None;
            return Err(VaultError::SessionExpired);
        }
        self.master_key.as_ref().ok_or(VaultError::SessionExpired)
    }

    /// Drop (and zeroize) the master key now.
    pub fn close(&mut self) {
        self.master_key = None;
    }
}

pub struct EnvelopeKeyManager {
    kem: Arc<KeyEncapsulationService>,
    store: Arc<dyn BlobStore>,
    audit: Arc<dyn AuditSink>,
    proofs: Option<Arc<ProofVerifier>>,
    session_ttl: Duration,
}

impl EnvelopeKeyManager {
    pub fn new(
        kem: Arc<KeyEncapsulationService>,
        store: Arc<dyn BlobStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            kem,
            store,
            audit,
            proofs: None,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Require a fresh identity proof on every registration.
    pub fn with_proof_verifier(mut self, verifier: Arc<ProofVerifier>) -> Self {
        self.proofs = Some(verifier);
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    fn check_proof(&self, device: &DeviceIdentity, proof: Option<&IdentityProof>) -> Result<()> {
        let Some(verifier) = &self.proofs else {
            return Ok(());
        };
        let (Some(proof), Some(dsa_key)) = (proof, device.dsa_public_key.as_ref()) else {
            return Err(VaultError::ProofRequired(device.device_id.clone()));
        };
        if proof.device_id != device.device_id {
            return Err(VaultError::SignatureVerification);
        }
        verifier.verify(proof, dsa_key)
    }

    /// Wrap `master_key` for `device` and persist the wrap under its device id.
    pub async fn register_device(
        &self,
        device: &DeviceIdentity,
        master_key: &MasterKey,
        proof: Option<&IdentityProof>,
    ) -> Result<WrappedMasterKey> {
        self.check_proof(device, proof)?;

        let encapsulated = self.kem.encapsulate(&device.kem_public_key)?;
        let kek = hash::derive_secret(WRAP_KEY_CONTEXT, encapsulated.shared_secret.as_bytes());
        let sealed = aead::seal_detached(&kek, master_key.as_bytes(), &wrap_aad(&device.device_id))?;

        let wrapped = WrappedMasterKey {
            device_id: device.device_id.clone(),
            user_id: device.user_id.clone(),
            implementation: encapsulated.implementation,
            kem_ciphertext: encapsulated.ciphertext,
            nonce: sealed.nonce.to_vec(),
            ciphertext: sealed.ciphertext,
            auth_tag: sealed.tag.to_vec(),
            created_at: Utc::now(),
        };

        storage::put_json(self.store.as_ref(), &wrap_key(&device.device_id), &wrapped).await?;

        info!(
            user_id = %device.user_id,
            device_id = %device.device_id,
            implementation = %wrapped.implementation,
            "Device registered"
        );
        self.audit.record(AuditEvent::DeviceRegistered {
            user_id: device.user_id.clone(),
            device_id: device.device_id.clone(),
            implementation: wrapped.implementation,
        });
        self.audit.record(AuditEvent::MasterKeyWrapped {
            device_id: device.device_id.clone(),
        });

        Ok(wrapped)
    }

    pub fn unwrap_master_key(
        &self,
        wrapped: &WrappedMasterKey,
        device_secret_key: &KemSecretKey,
    ) -> Result<MasterKey> {
        let result = self.unwrap_inner(wrapped, device_secret_key);
        if let Err(e) = &result {
            warn!(device_id = %wrapped.device_id, error = %e, "Master key unwrap failed");
        }
        self.audit.record(AuditEvent::MasterKeyUnwrapped {
            device_id: wrapped.device_id.clone(),
            success: result.is_ok(),
        });
        result
    }

    fn unwrap_inner(&self, wrapped: &WrappedMasterKey, device_secret_key: &KemSecretKey) -> Result<MasterKey> {
        if wrapped.implementation != device_secret_key.implementation {
            return Err(VaultError::ImplementationMismatch {
                key: device_secret_key.implementation.name(),
                expected: wrapped.implementation.name(),
            });
        }

        let shared = self.kem.decapsulate(&wrapped.kem_ciphertext, device_secret_key)?;
        let kek = hash::derive_secret(WRAP_KEY_CONTEXT, shared.as_bytes());
        let plaintext = SensitiveBytes32::from_slice(&aead::open_detached(
            &kek,
            &wrapped.nonce,
            &wrapped.ciphertext,
            &wrapped.auth_tag,
            &wrap_aad(&wrapped.device_id),
        )?)
        .ok_or_else(|| VaultError::Decryption("wrapped master key has wrong length".into()))?;
        Ok(MasterKey(plaintext))
    }

    pub async fn load(&self, device_id: &str) -> Result<WrappedMasterKey> {
        storage::get_json(self.store.as_ref(), &wrap_key(device_id))
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("master key wrap for device {device_id}")))
    }

    /// Load the stored wrap for `device_id` and unwrap it.
    pub async fn unwrap_for_device(&self, device_id: &str, device_secret_key: &KemSecretKey) -> Result<MasterKey> {
        let wrapped = self.load(device_id).await?;
        self.unwrap_master_key(&wrapped, device_secret_key)
    }

    pub async fn open_session(&self, device_id: &str, device_secret_key: &KemSecretKey) -> Result<VaultSession> {
        let master_key = self.unwrap_for_device(device_id, device_secret_key).await?;
        VaultSession::new(device_id.to_string(), master_key, self.session_ttl)
    }

    /// Device ids with a stored wrap.
    pub async fn list_devices(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list("wrap/")
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix("wrap/").map(str::to_string))
            .collect())
    }

    /// Delete one device's wrap. Other devices are unaffected.
    pub async fn revoke_device(&self, device_id: &str) -> Result<()> {
        let key = wrap_key(device_id);
        if self.store.get(&key).await?.is_none() {
            return Err(VaultError::NotFound(format!("master key wrap for device {device_id}")));
        }
        self.store.delete(&key).await?;

        info!(device_id, "Device revoked");
        self.audit.record(AuditEvent::DeviceRevoked {
            device_id: device_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::pq::capability::{CapabilityContext, PrimitiveState};
    use crate::pq::kem::KemKeyPair;
    use crate::pq::proof::create_proof;
    use crate::pq::sign::SignatureService;
    use crate::pq::Algorithm;
    use crate::storage::MemoryStore;

    pub(crate) struct Fixture {
        pub kem: Arc<KeyEncapsulationService>,
        pub store: Arc<MemoryStore>,
        pub audit: Arc<RecordingAuditSink>,
        pub manager: EnvelopeKeyManager,
    }

    pub(crate) fn fixture(context: Arc<CapabilityContext>) -> Fixture {
        let audit = Arc::new(RecordingAuditSink::new());
        let kem = Arc::new(KeyEncapsulationService::new(context, audit.clone()));
        let store = Arc::new(MemoryStore::new());
        let manager = EnvelopeKeyManager::new(kem.clone(), store.clone(), audit.clone());
        Fixture {
            kem,
            store,
            audit,
            manager,
        }
    }

    pub(crate) fn device(kem: &KeyEncapsulationService, id: &str, seed: u8) -> (DeviceIdentity, KemKeyPair) {
        let kp = kem.generate_key_pair(&[seed; 64]).unwrap();
        let identity = DeviceIdentity {
            user_id: "user-1".into(),
            device_id: id.into(),
            kem_public_key: kp.public_key.clone(),
            dsa_public_key: None,
        };
        (identity, kp)
    }

    #[tokio::test]
    async fn test_register_and_unwrap() {
        let f = fixture(Arc::new(CapabilityContext::default()));
        let (d1, kp1) = device(&f.kem, "D1", 1);
        let mk = MasterKey::generate();

        let wrapped = f.manager.register_device(&d1, &mk, None).await.unwrap();
        assert_eq!(wrapped.nonce.len(), 24);
        assert_eq!(wrapped.ciphertext.len(), 32);
        assert_eq!(wrapped.auth_tag.len(), 16);
        assert_eq!(wrapped.kem_ciphertext.len(), 1088);

        let loaded = f.manager.load("D1").await.unwrap();
        assert_eq!(loaded, wrapped);
        let unwrapped = f.manager.unwrap_master_key(&loaded, &kp1.secret_key).unwrap();
        assert_eq!(unwrapped.as_bytes(), mk.as_bytes());
    }

    #[tokio::test]
    async fn test_wrong_device_key_fails() {
        let f = fixture(Arc::new(CapabilityContext::default()));
        let (d1, _) = device(&f.kem, "D1", 1);
        let (_, kp2) = device(&f.kem, "D2", 2);
        let wrapped = f.manager.register_device(&d1, &MasterKey::generate(), None).await.unwrap();

        assert!(matches!(
            f.manager.unwrap_master_key(&wrapped, &kp2.secret_key),
            Err(VaultError::AuthenticationTagMismatch)
        ));
        assert!(f
            .audit
            .events()
            .contains(&AuditEvent::MasterKeyUnwrapped {
                device_id: "D1".into(),
                success: false
            }));
    }

    #[tokio::test]
    async fn test_wrap_bound_to_device_id() {
        let f = fixture(Arc::new(CapabilityContext::default()));
        let (d1, kp1) = device(&f.kem, "D1", 1);
        let mut wrapped = f.manager.register_device(&d1, &MasterKey::generate(), None).await.unwrap();

        wrapped.device_id = "D9".into();
        assert!(matches!(
            f.manager.unwrap_master_key(&wrapped, &kp1.secret_key),
            Err(VaultError::AuthenticationTagMismatch)
        ));
    }

    #[tokio::test]
    async fn test_revoke_only_affects_one_device() {
        let f = fixture(Arc::new(CapabilityContext::default()));
        let (d1, _) = device(&f.kem, "D1", 1);
        let (d2, kp2) = device(&f.kem, "D2", 2);
        let mk = MasterKey::generate();
        f.manager.register_device(&d1, &mk, None).await.unwrap();
        f.manager.register_device(&d2, &mk, None).await.unwrap();
        assert_eq!(f.manager.list_devices().await.unwrap(), vec!["D1", "D2"]);

        f.manager.revoke_device("D1").await.unwrap();
        assert!(matches!(f.manager.load("D1").await, Err(VaultError::NotFound(_))));
        assert!(matches!(f.manager.revoke_device("D1").await, Err(VaultError::NotFound(_))));

        let mk2 = f.manager.unwrap_for_device("D2", &kp2.secret_key).await.unwrap();
        assert_eq!(mk2.as_bytes(), mk.as_bytes());
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_fallback_device_round_trip() {
        let context = Arc::new(CapabilityContext::with_states(
            Duration::from_secs(60),
            PrimitiveState::Unavailable,
            PrimitiveState::Untested,
        ));
        let f = fixture(context);
        let (d1, kp1) = device(&f.kem, "D1", 1);
        assert_eq!(kp1.implementation(), Implementation::Fallback);

        let mk = MasterKey::generate();
        let wrapped = f.manager.register_device(&d1, &mk, None).await.unwrap();
        assert_eq!(wrapped.implementation, Implementation::Fallback);
        let back = f.manager.unwrap_master_key(&wrapped, &kp1.secret_key).unwrap();
        assert_eq!(back.as_bytes(), mk.as_bytes());
    }

    #[tokio::test]
    async fn test_primary_wrap_survives_demotion() {
        let context = Arc::new(CapabilityContext::default());
        let f = fixture(context.clone());
        let (d1, kp1) = device(&f.kem, "D1", 1);
        assert_eq!(kp1.implementation(), Implementation::Primary);
        let mk = MasterKey::generate();
        f.manager.register_device(&d1, &mk, None).await.unwrap();

        f.kem.demote("encapsulate: ciphertext length mismatch");
        assert_eq!(context.state(Algorithm::Kem), PrimitiveState::Unavailable);

        let back = f.manager.unwrap_for_device("D1", &kp1.secret_key).await.unwrap();
        assert_eq!(back.as_bytes(), mk.as_bytes());

        // New devices land on the fallback.
        let (d2, kp2) = device(&f.kem, "D2", 2);
        assert_eq!(kp2.implementation(), Implementation::Fallback);
        f.manager.register_device(&d2, &mk, None).await.unwrap();
        let back = f.manager.unwrap_for_device("D2", &kp2.secret_key).await.unwrap();
        assert_eq!(back.as_bytes(), mk.as_bytes());
    }

    #[tokio::test]
    async fn test_registration_requires_proof_when_configured() {
        let context = Arc::new(CapabilityContext::default());
        let audit = Arc::new(RecordingAuditSink::new());
        let signatures = Arc::new(SignatureService::new(context.clone(), audit.clone()));
        let verifier = Arc::new(ProofVerifier::with_defaults(signatures.clone()));
        let f = fixture(context);
        let manager = EnvelopeKeyManager::new(f.kem.clone(), f.store.clone(), audit)
            .with_proof_verifier(verifier);

        let dsa = signatures.generate_key_pair(&[7u8; 32]).unwrap();
        let (mut d1, _) = device(&f.kem, "D1", 1);
        let mk = MasterKey::generate();

        assert!(matches!(
            manager.register_device(&d1, &mk, None).await,
            Err(VaultError::ProofRequired(_))
        ));

        d1.dsa_public_key = Some(dsa.public_key.clone());
        let proof = create_proof(&signatures, "D1", &dsa.secret_key, &[1u8; 16]).unwrap();
        manager.register_device(&d1, &mk, Some(&proof)).await.unwrap();

        assert!(matches!(
            manager.register_device(&d1, &mk, Some(&proof)).await,
            Err(VaultError::ProofReplayed)
        ));

        let other = create_proof(&signatures, "D2", &dsa.secret_key, &[2u8; 16]).unwrap();
        assert!(matches!(
            manager.register_device(&d1, &mk, Some(&other)).await,
            Err(VaultError::SignatureVerification)
        ));
    }

    #[tokio::test]
    async fn test_session_close_and_expiry() {
        let f = fixture(Arc::new(CapabilityContext::default()));
        let (d1, kp1) = device(&f.kem, "D1", 1);
        let mk = MasterKey::generate();
        f.manager.register_device(&d1, &mk, None).await.unwrap();

        let mut session = f.manager.open_session("D1", &kp1.secret_key).await.unwrap();
        assert!(session.is_open());
        assert_eq!(session.master_key().unwrap().as_bytes(), mk.as_bytes());
        session.close();
        assert!(matches!(session.master_key(), Err(VaultError::SessionExpired)));

        let mut expired = VaultSession::new("D1".into(), mk, Duration::ZERO).unwrap();
        assert!(!expired.is_open());
        assert!(expired.master_key.is_some());
        assert!(matches!(expired.master_key(), Err(VaultError::SessionExpired)));
        assert!(expired.master_key.is_none());
        assert!(matches!(expired.master_key(), Err(VaultError::SessionExpired)));
    }

    #[test]
    fn test_session_ttl_out_of_range() {
        let err = VaultSession::new(
            "D1".into(),
            MasterKey::generate(),
            Duration::from_secs(10_000_000_000_000),
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }
}
