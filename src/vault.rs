/// Wires every component from one [`CoreConfig`], a blob store and an audit sink.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::config::CoreConfig;
use crate::crypto::entropy::{EntropyPool, EntropySource, HttpEntropySource};
use crate::envelope::EnvelopeKeyManager;
use crate::error::Result;
use crate::items::ItemCipher;
use crate::pq::capability::{CapabilityContext, CapabilityProbe, CapabilityReport, CapabilitySet};
use crate::pq::kem::{KemKeyPair, KeyEncapsulationService};
use crate::pq::proof::ProofVerifier;
use crate::pq::sign::{DsaKeyPair, SignatureService};
use crate::recovery::RecoveryKitService;
use crate::storage::BlobStore;

pub struct VaultCore {
    config: CoreConfig,
    context: Arc<CapabilityContext>,
    kem: Arc<KeyEncapsulationService>,
    dsa: Arc<SignatureService>,
    probe: Arc<CapabilityProbe>,
    proofs: Arc<ProofVerifier>,
    entropy: EntropyPool,
    envelope: EnvelopeKeyManager,
    items: ItemCipher,
    recovery: RecoveryKitService,
}

impl VaultCore {
    pub fn new(config: CoreConfig, store: Arc<dyn BlobStore>, audit: Arc<dyn AuditSink>) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(CapabilityContext::new(config.capability.probe_interval()));
        let kem = Arc::new(KeyEncapsulationService::new(context.clone(), audit.clone()));
        let dsa = Arc::new(SignatureService::new(context.clone(), audit.clone()));
        Self::assemble(config, context, kem, dsa, store, audit)
    }

    /// Build around pre-constructed primitive services (custom backends, pinned context).
    pub fn assemble(
        config: CoreConfig,
        context: Arc<CapabilityContext>,
        kem: Arc<KeyEncapsulationService>,
        dsa: Arc<SignatureService>,
        store: Arc<dyn BlobStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let probe = Arc::new(CapabilityProbe::new(context.clone(), kem.clone(), dsa.clone()));
        let proofs = Arc::new(ProofVerifier::new(
            dsa.clone(),
            Duration::from_secs(config.proof.freshness_secs),
            Duration::from_secs(config.proof.future_skew_secs),
        ));

        let mut sources: Vec<Arc<dyn EntropySource>> = Vec::with_capacity(config.entropy.sources.len());
        for source in &config.entropy.sources {
            sources.push(Arc::new(HttpEntropySource::new(
                source.clone(),
                config.entropy.timeout(),
            )?));
        }
        let entropy = EntropyPool::new(sources, config.entropy.timeout());

        let mut envelope = EnvelopeKeyManager::new(kem.clone(), store.clone(), audit.clone())
            .with_session_ttl(Duration::from_secs(config.session.ttl_secs));
        if config.proof.required {
            envelope = envelope.with_proof_verifier(proofs.clone());
        }

        let items = ItemCipher::new(store.clone());
        let recovery = RecoveryKitService::new(kem.clone(), store, audit)
            .with_validity(config.recovery.kit_validity());

        Ok(Self {
            config,
            context,
            kem,
            dsa,
            probe,
            proofs,
            entropy,
            envelope,
            items,
            recovery,
        })
    }

    /// Run the initial probe and, if configured, start periodic re-probing.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let snapshot = self.probe.force_probe();
        info!(
            kem = snapshot.active_implementation(crate::pq::Algorithm::Kem).name(),
            dsa = snapshot.active_implementation(crate::pq::Algorithm::Dsa).name(),
            entropy_sources = self.entropy.source_count(),
            "Vault core started"
        );
        if snapshot.fallback_transitions > 0 {
            warn!(
                transitions = snapshot.fallback_transitions,
                "Running with fallback primitives"
            );
        }
        self.config
            .capability
            .periodic
            .then(|| self.probe.clone().spawn_periodic())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Arc<CapabilitySet> {
        self.context.snapshot()
    }

    pub fn capability_context(&self) -> &Arc<CapabilityContext> {
        &self.context
    }

    pub fn report(&self) -> CapabilityReport {
        self.probe.report()
    }

    pub fn kem(&self) -> &Arc<KeyEncapsulationService> {
        &self.kem
    }

    pub fn dsa(&self) -> &Arc<SignatureService> {
        &self.dsa
    }

    pub fn probe(&self) -> &Arc<CapabilityProbe> {
        &self.probe
    }

    pub fn proofs(&self) -> &Arc<ProofVerifier> {
        &self.proofs
    }

    pub fn entropy(&self) -> &EntropyPool {
        &self.entropy
    }

    pub fn envelope(&self) -> &EnvelopeKeyManager {
        &self.envelope
    }

    pub fn items(&self) -> &ItemCipher {
        &self.items
    }

    pub fn recovery(&self) -> &RecoveryKitService {
        &self.recovery
    }

    /// Fresh KEM key pair seeded from the entropy pool.
    pub async fn generate_kem_key_pair(&self) -> Result<KemKeyPair> {
        let seed = self.entropy.kem_seed().await;
        self.kem.generate_key_pair(seed.as_bytes())
    }

    /// Fresh DSA key pair seeded from the entropy pool.
    pub async fn generate_dsa_key_pair(&self) -> Result<DsaKeyPair> {
        let seed = self.entropy.dsa_seed().await;
        self.dsa.generate_key_pair(seed.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEvent, RecordingAuditSink};
    use crate::envelope::{DeviceIdentity, MasterKey};
    use crate::items::VaultItem;
    use crate::pq::capability::PrimitiveState;
    use crate::pq::proof::create_proof;
    use crate::pq::{Algorithm, Implementation};
    use crate::recovery::Guardian;
    use crate::storage::MemoryStore;

    fn build(config: CoreConfig) -> (VaultCore, Arc<RecordingAuditSink>) {
        let audit = Arc::new(RecordingAuditSink::new());
        let core = VaultCore::new(config, Arc::new(MemoryStore::new()), audit.clone()).unwrap();
        (core, audit)
    }

    #[tokio::test]
    async fn test_start_probes_primitives() {
        let (core, _) = build(CoreConfig::default());
        assert!(core.start().is_none());
        let caps = core.capabilities();
        assert_eq!(caps.kem.state, PrimitiveState::Available);
        assert_eq!(caps.dsa.state, PrimitiveState::Available);
        assert_eq!(core.report().algorithms.len(), 2);
    }

    #[tokio::test]
    async fn test_periodic_probe_handle() {
        let mut config = CoreConfig::default();
        config.capability.periodic = true;
        let (core, _) = build(config);
        let handle = core.start().unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn test_device_flow_with_required_proof() {
        let mut config = CoreConfig::default();
        config.proof.required = true;
        let (core, audit) = build(config);
        core.start();

        let kem = core.generate_kem_key_pair().await.unwrap();
        let dsa = core.generate_dsa_key_pair().await.unwrap();
        assert_eq!(kem.implementation(), Implementation::Primary);

        let device = DeviceIdentity {
            user_id: "alice".into(),
            device_id: "laptop".into(),
            kem_public_key: kem.public_key.clone(),
            dsa_public_key: Some(dsa.public_key.clone()),
        };
        let proof = create_proof(core.dsa(), "laptop", &dsa.secret_key, &[9u8; 32]).unwrap();
        let mk = MasterKey::generate();
        core.envelope().register_device(&device, &mk, Some(&proof)).await.unwrap();

        let mut session = core.envelope().open_session("laptop", &kem.secret_key).await.unwrap();
        let item = VaultItem::new("demo", "u", "p");
        let record = core.items().encrypt_item(&item, session.master_key().unwrap()).unwrap();
        core.items().put_item(&record).await.unwrap();
        let loaded = core.items().get_item(&item.id).await.unwrap();
        assert_eq!(core.items().decrypt_item(&loaded, session.master_key().unwrap()).unwrap(), item);

        assert!(audit
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::DeviceRegistered { device_id, .. } if device_id == "laptop")));
    }

    #[tokio::test]
    async fn test_recovery_flow_on_fallback() {
        let (core, _) = build(CoreConfig::default());
        core.capability_context().mark_unavailable(Algorithm::Kem, "pinned for test");

        let mut guardians = Vec::new();
        let mut keys = Vec::new();
        for i in 0..3 {
            let kp = core.generate_kem_key_pair().await.unwrap();
            assert_eq!(kp.implementation(), Implementation::Fallback);
            guardians.push(Guardian {
                id: uuid::Uuid::new_v4(),
                name: format!("g{i}"),
                kem_public_key: kp.public_key.clone(),
                verified: true,
            });
            keys.push(kp);
        }

        let mk = MasterKey::generate();
        let kit = core.recovery().generate_kit(mk.as_bytes(), &guardians, 2).await.unwrap();
        let kit = core.recovery().distribute(kit.id).await.unwrap();
        let shares: Vec<_> = [0usize, 2]
            .iter()
            .map(|&i| core.recovery().open_share(&kit.shares[i], &keys[i].secret_key).unwrap())
            .collect();
        let secret = core.recovery().recover(kit.id, &shares).await.unwrap();
        assert_eq!(secret.as_bytes(), mk.as_bytes());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = CoreConfig::default();
        config.capability.probe_interval_secs = 0;
        assert!(VaultCore::new(config, Arc::new(MemoryStore::new()), Arc::new(RecordingAuditSink::new())).is_err());
    }
}
