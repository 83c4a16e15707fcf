/// Recovery kit lifecycle.
///
/// ```text
/// created ──distribute──▶ active ──recover ok──▶ consumed
///    │                      ├──── expiry ──────▶ expired
///    └────── revoke ────────┴──── revoke ──────▶ revoked
/// ```
///
/// A kit stores only public data: the secret's BLAKE3 fingerprint, each
/// share's checksum, and every share encrypted to its guardian's KEM key.
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use super::shamir::{self, Share};
use crate::audit::{AuditEvent, AuditSink};
use crate::crypto::sensitive::SensitiveVec;
use crate::crypto::{aead, hash};
use crate::error::{Result, VaultError};
use crate::pq::kem::{KemPublicKey, KemSecretKey, KeyEncapsulationService};
use crate::pq::Implementation;
use crate::storage::{self, BlobStore};

const SHARE_WRAP_CONTEXT: &str = "pqvault 2024-06 guardian share wrap v1";

pub const DEFAULT_KIT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guardian {
    pub id: Uuid,
    pub name: String,
    pub kem_public_key: KemPublicKey,
    pub verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareStatus {
    Created,
    Distributed,
    Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KitStatus {
    Created,
    Active,
    Consumed,
    Expired,
    Revoked,
}

impl KitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, KitStatus::Consumed | KitStatus::Expired | KitStatus::Revoked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KitStatus::Created => "created",
            KitStatus::Active => "active",
            KitStatus::Consumed => "consumed",
            KitStatus::Expired => "expired",
            KitStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for KitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One share, encrypted to its guardian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryShare {
    pub kit_id: Uuid,
    pub share_index: u8,
    pub guardian_id: Uuid,
    pub implementation: Implementation,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub kem_ciphertext: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub nonce: Vec<u8>,
    /// Share bytes followed by the AEAD tag.
    #[serde(with = "crate::encoding::hex_bytes")]
    pub encrypted_share_data: Vec<u8>,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub checksum: Vec<u8>,
    pub status: ShareStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryKit {
    pub id: Uuid,
    pub shares_total: u8,
    pub shares_required: u8,
    #[serde(with = "crate::encoding::hex_bytes")]
    pub seed_hash: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: KitStatus,
    pub shares: Vec<RecoveryShare>,
}

impl RecoveryKit {
    pub fn is_active(&self) -> bool {
        self.status == KitStatus::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == KitStatus::Expired || self.expires_at.is_some_and(|at| now >= at)
    }

    /// The stored checksum for `index`, if the kit has such a share.
    fn stored_checksum(&self, index: u8) -> Option<[u8; 32]> {
        self.shares
            .iter()
            .find(|s| s.share_index == index)
            .and_then(|s| s.checksum.as_slice().try_into().ok())
    }
}

fn kit_key(id: &Uuid) -> String {
    format!("kit/{id}")
}

fn share_aad(kit_id: &Uuid, index: u8, guardian_id: &Uuid) -> Vec<u8> {
    let mut aad = Vec::with_capacity(33);
    aad.extend_from_slice(kit_id.as_bytes());
    aad.push(index);
    aad.extend_from_slice(guardian_id.as_bytes());
    aad
}

type KitLocks = Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>;

/// Holds one kit's lock; the map entry is dropped with the last holder.
struct KitGuard<'a> {
    locks: &'a KitLocks,
    kit_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KitGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.kit_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.kit_id);
        }
    }
}

pub struct RecoveryKitService {
    kem: Arc<KeyEncapsulationService>,
    store: Arc<dyn BlobStore>,
    audit: Arc<dyn AuditSink>,
    validity: Duration,
    locks: KitLocks,
}

impl RecoveryKitService {
    pub fn new(
        kem: Arc<KeyEncapsulationService>,
        store: Arc<dyn BlobStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            kem,
            store,
            audit,
            validity: DEFAULT_KIT_VALIDITY,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// How long a kit stays recoverable after distribution.
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Waiters clone the entry under the map lock, so a strong count of one
    /// at release means nobody else is queued on this kit.
    async fn lock_kit(&self, kit_id: Uuid) -> KitGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kit_id)
            .or_default()
            .clone();
        let mut held = KitGuard {
            locks: &self.locks,
            kit_id,
            guard: None,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn get_kit(&self, kit_id: Uuid) -> Result<RecoveryKit> {
        storage::get_json(self.store.as_ref(), &kit_key(&kit_id))
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("recovery kit {kit_id}")))
    }

    async fn save_kit(&self, kit: &RecoveryKit) -> Result<()> {
        storage::put_json(self.store.as_ref(), &kit_key(&kit.id), kit).await
    }

    /// Split `secret` across `guardians`, one share each, encrypted to their KEM keys.
    pub async fn generate_kit(
        &self,
        secret: &[u8],
        guardians: &[Guardian],
        threshold: u8,
    ) -> Result<RecoveryKit> {
        if let Some(g) = guardians.iter().find(|g| !g.verified) {
            return Err(VaultError::GuardianUnverified(g.id));
        }
        let distinct: BTreeSet<Uuid> = guardians.iter().map(|g| g.id).collect();
        if distinct.len() != guardians.len() {
            return Err(VaultError::InconsistentShares("guardian listed twice".into()));
        }

        let shares = shamir::split(secret, guardians.len(), threshold)?;
        let kit_id = Uuid::now_v7();

        let mut encrypted = Vec::with_capacity(shares.len());
        for (share, guardian) in shares.iter().zip(guardians) {
            let enc = self.kem.encapsulate(&guardian.kem_public_key)?;
            let key = hash::derive_secret(SHARE_WRAP_CONTEXT, enc.shared_secret.as_bytes());
            let plaintext = share.to_bytes();
            let (nonce, ciphertext) = aead::encrypt(
                &key,
                plaintext.as_bytes(),
                &share_aad(&kit_id, share.index, &guardian.id),
            )?;

            encrypted.push(RecoveryShare {
                kit_id,
                share_index: share.index,
                guardian_id: guardian.id,
                implementation: enc.implementation,
                kem_ciphertext: enc.ciphertext,
                nonce: nonce.to_vec(),
                encrypted_share_data: ciphertext,
                checksum: share.checksum.to_vec(),
                status: ShareStatus::Created,
            });
        }

        let kit = RecoveryKit {
            id: kit_id,
            shares_total: shares.len() as u8,
            shares_required: threshold,
            seed_hash: hash::seed_hash(secret).to_vec(),
            created_at: Utc::now(),
            activated_at: None,
            expires_at: None,
            status: KitStatus::Created,
            shares: encrypted,
        };
        self.save_kit(&kit).await?;

        info!(
            kit_id = %kit.id,
            shares_total = kit.shares_total,
            shares_required = kit.shares_required,
            "Recovery kit created"
        );
        self.audit.record(AuditEvent::RecoveryKitCreated {
            kit_id: kit.id,
            shares_total: kit.shares_total,
            shares_required: kit.shares_required,
        });
        Ok(kit)
    }

    /// Hand shares to guardians: kit becomes active and the expiry clock starts.
    pub async fn distribute(&self, kit_id: Uuid) -> Result<RecoveryKit> {
        let _guard = self.lock_kit(kit_id).await;

        let mut kit = self.get_kit(kit_id).await?;
        if kit.status != KitStatus::Created {
            return Err(VaultError::RecoveryKitInactive {
                kit_id,
                status: kit.status.to_string(),
            });
        }

        let now = Utc::now();
        let validity = chrono::Duration::from_std(self.validity)
            .map_err(|e| VaultError::Config(format!("kit validity: {e}")))?;
        let expires_at = now
            .checked_add_signed(validity)
            .ok_or_else(|| VaultError::Config(format!("kit validity {validity} overflows the calendar")))?;
        kit.status = KitStatus::Active;
        kit.activated_at = Some(now);
        kit.expires_at = Some(expires_at);
        for share in &mut kit.shares {
            share.status = ShareStatus::Distributed;
        }
        self.save_kit(&kit).await?;

        info!(kit_id = %kit_id, %expires_at, "Recovery kit distributed");
        self.audit
            .record(AuditEvent::RecoveryKitDistributed { kit_id, expires_at });
        Ok(kit)
    }

    /// Guardian side: decrypt one share with the guardian's KEM secret key.
    pub fn open_share(&self, share: &RecoveryShare, guardian_secret_key: &KemSecretKey) -> Result<Share> {
        if share.implementation != guardian_secret_key.implementation {
            return Err(VaultError::ImplementationMismatch {
                key: guardian_secret_key.implementation.name(),
                expected: share.implementation.name(),
            });
        }
        let shared = self.kem.decapsulate(&share.kem_ciphertext, guardian_secret_key)?;
        let key = hash::derive_secret(SHARE_WRAP_CONTEXT, shared.as_bytes());
        let nonce = aead::nonce_from_slice(&share.nonce)?;
        let plaintext = SensitiveVec::new(aead::decrypt(
            &key,
            &nonce,
            &share.encrypted_share_data,
            &share_aad(&share.kit_id, share.share_index, &share.guardian_id),
        )?);
        Share::from_bytes(plaintext.as_bytes())
    }

    fn audit_attempt(&self, kit_id: Uuid, valid: usize, rejected: usize, error: Option<&VaultError>) {
        self.audit.record(AuditEvent::RecoveryAttempt {
            kit_id,
            success: error.is_none(),
            valid_shares: valid,
            rejected_shares: rejected,
            reason: error.map(|e| e.to_string()),
        });
    }

    /// Reconstruct the kit secret and consume the kit.
    ///
    /// Attempts on the same kit are serialized. A failed attempt leaves an
    /// active kit active.
    pub async fn recover(&self, kit_id: Uuid, shares: &[Share]) -> Result<SensitiveVec> {
        let _guard = self.lock_kit(kit_id).await;

        let mut kit = match self.get_kit(kit_id).await {
            Ok(kit) => kit,
            Err(e) => {
                self.audit_attempt(kit_id, 0, shares.len(), Some(&e));
                return Err(e);
            }
        };

        let now = Utc::now();
        if kit.status == KitStatus::Active && kit.is_expired_at(now) {
            kit.status = KitStatus::Expired;
            self.save_kit(&kit).await?;
            info!(kit_id = %kit_id, "Recovery kit expired");
            self.audit.record(AuditEvent::RecoveryKitExpired { kit_id });
        }
        if !kit.is_active() {
            let err = if kit.status == KitStatus::Expired {
                VaultError::RecoveryKitExpired(kit_id)
            } else {
                VaultError::RecoveryKitInactive {
                    kit_id,
                    status: kit.status.to_string(),
                }
            };
            self.audit_attempt(kit_id, 0, shares.len(), Some(&err));
            return Err(err);
        }

        // A share counts only if its own checksum holds and matches the kit's record.
        let (candidates, _) = shamir::select_valid(shares);
        let valid: Vec<Share> = candidates
            .into_iter()
            .filter(|s| {
                s.threshold == kit.shares_required
                    && kit
                        .stored_checksum(s.index)
                        .is_some_and(|stored| hash::digest_eq(&stored, &s.checksum))
            })
            .cloned()
            .collect();
        let rejected = shares.len() - valid.len();

        let secret = match shamir::combine_with_threshold(&valid, kit.shares_required) {
            Ok(secret) => secret,
            Err(e) => {
                warn!(kit_id = %kit_id, valid = valid.len(), rejected, error = %e, "Recovery attempt failed");
                self.audit_attempt(kit_id, valid.len(), rejected, Some(&e));
                return Err(e);
            }
        };

        let stored: Option<[u8; 32]> = kit.seed_hash.as_slice().try_into().ok();
        let matches = stored.is_some_and(|h| hash::digest_eq(&h, &hash::seed_hash(secret.as_bytes())));
        if !matches {
            let err = VaultError::SecretMismatchAfterReconstruction;
            warn!(kit_id = %kit_id, "Reconstructed secret does not match kit");
            self.audit_attempt(kit_id, valid.len(), rejected, Some(&err));
            return Err(err);
        }

        kit.status = KitStatus::Consumed;
        for share in &mut kit.shares {
            share.status = ShareStatus::Consumed;
        }
        self.save_kit(&kit).await?;

        info!(kit_id = %kit_id, valid = valid.len(), rejected, "Recovery kit consumed");
        self.audit_attempt(kit_id, valid.len(), rejected, None);
        Ok(secret)
    }

    /// Revoke a kit that is not yet terminal.
    pub async fn revoke(&self, kit_id: Uuid) -> Result<RecoveryKit> {
        let _guard = self.lock_kit(kit_id).await;

        let mut kit = self.get_kit(kit_id).await?;
        if kit.status.is_terminal() {
            return Err(VaultError::RecoveryKitInactive {
                kit_id,
                status: kit.status.to_string(),
            });
        }
        kit.status = KitStatus::Revoked;
        self.save_kit(&kit).await?;

        info!(kit_id = %kit_id, "Recovery kit revoked");
        self.audit.record(AuditEvent::RecoveryKitRevoked { kit_id });
        Ok(kit)
    }
}
