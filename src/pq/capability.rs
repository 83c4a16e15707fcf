/// Runtime capability detection for the post-quantum primitives.
///
/// Per algorithm the primary implementation moves through a small state machine:
///
/// ```text
/// Untested ──probe/first use ok──▶ Available
///     │                               │
///     └──────── misbehaves ───────────┴──▶ Unavailable (sticky until reset)
/// ```
///
/// The current [`CapabilitySet`] is published as an immutable `Arc` snapshot.
/// Writers build a modified copy and swap it in under the lock, so readers
/// never observe a mix of old and new flags.
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::kem::KeyEncapsulationService;
use super::sign::SignatureService;
use super::{Algorithm, Implementation, ML_DSA_65, ML_KEM_768};

/// Default re-probe interval.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveState {
    Untested,
    Available,
    Unavailable,
}

/// State of one algorithm's primary implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmStatus {
    pub state: PrimitiveState,
    pub reason: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
}

impl AlgorithmStatus {
    fn untested() -> Self {
        Self {
            state: PrimitiveState::Untested,
            reason: None,
            changed_at: None,
        }
    }
}

/// Immutable snapshot of what the process can currently use.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    pub kem: AlgorithmStatus,
    pub dsa: AlgorithmStatus,
    pub probed_at: Option<DateTime<Utc>>,
    pub probe_interval: Duration,
    /// Number of Available/Untested → Unavailable transitions so far.
    pub fallback_transitions: u64,
}

impl CapabilitySet {
    pub fn status(&self, algorithm: Algorithm) -> &AlgorithmStatus {
        match algorithm {
            Algorithm::Kem => &self.kem,
            Algorithm::Dsa => &self.dsa,
        }
    }

    fn status_mut(&mut self, algorithm: Algorithm) -> &mut AlgorithmStatus {
        match algorithm {
            Algorithm::Kem => &mut self.kem,
            Algorithm::Dsa => &mut self.dsa,
        }
    }

    /// Whether the primary implementation may still be attempted.
    pub fn primary_usable(&self, algorithm: Algorithm) -> bool {
        self.status(algorithm).state != PrimitiveState::Unavailable
    }

    pub fn kem_usable(&self) -> bool {
        self.primary_usable(Algorithm::Kem)
    }

    pub fn dsa_usable(&self) -> bool {
        self.primary_usable(Algorithm::Dsa)
    }

    /// Implementation that new keys for `algorithm` will come from.
    pub fn active_implementation(&self, algorithm: Algorithm) -> Implementation {
        if self.primary_usable(algorithm) {
            Implementation::Primary
        } else {
            Implementation::Fallback
        }
    }

    pub fn probe_due(&self, now: DateTime<Utc>) -> bool {
        match self.probed_at {
            None => true,
            Some(at) => {
                let interval = chrono::Duration::from_std(self.probe_interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                now - at >= interval
            }
        }
    }
}

/// Injectable holder of the process-wide capability snapshot.
#[derive(Debug)]
pub struct CapabilityContext {
    current: RwLock<Arc<CapabilitySet>>,
}

impl CapabilityContext {
    pub fn new(probe_interval: Duration) -> Self {
        Self::with_states(
            probe_interval,
            PrimitiveState::Untested,
            PrimitiveState::Untested,
        )
    }

    /// Start from explicit states, e.g. to pin the fallback in tests.
    pub fn with_states(probe_interval: Duration, kem: PrimitiveState, dsa: PrimitiveState) -> Self {
        let status = |state| AlgorithmStatus {
            state,
            ..AlgorithmStatus::untested()
        };
        Self {
            current: RwLock::new(Arc::new(CapabilitySet {
                kem: status(kem),
                dsa: status(dsa),
                probed_at: None,
                probe_interval,
                fallback_transitions: 0,
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<CapabilitySet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self, algorithm: Algorithm) -> PrimitiveState {
        self.snapshot().status(algorithm).state
    }

    /// Copy, modify, swap. Returns the value produced by `f`.
    fn update<R>(&self, f: impl FnOnce(&mut CapabilitySet) -> R) -> R {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = CapabilitySet::clone(&guard);
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }

    /// Record a successful primary run. No effect once Unavailable.
    pub fn mark_available(&self, algorithm: Algorithm) {
        if self.state(algorithm) == PrimitiveState::Available {
            return;
        }
        self.update(|set| {
            let status = set.status_mut(algorithm);
            if status.state == PrimitiveState::Untested {
                status.state = PrimitiveState::Available;
                status.changed_at = Some(Utc::now());
            }
        });
    }

    /// Returns true only for the call that performed the transition.
    pub fn mark_unavailable(&self, algorithm: Algorithm, reason: &str) -> bool {
        self.update(|set| {
            let status = set.status_mut(algorithm);
            if status.state == PrimitiveState::Unavailable {
                return false;
            }
            status.state = PrimitiveState::Unavailable;
            status.reason = Some(reason.to_string());
            status.changed_at = Some(Utc::now());
            set.fallback_transitions += 1;
            true
        })
    }

    /// Explicit operator reset: the primary will be tried again.
    pub fn reset(&self, algorithm: Algorithm) {
        self.update(|set| {
            *set.status_mut(algorithm) = AlgorithmStatus::untested();
        });
    }

    fn record_probe(&self, at: DateTime<Utc>) {
        self.update(|set| set.probed_at = Some(at));
    }
}

impl Default for CapabilityContext {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_INTERVAL)
    }
}

/// Serializable view of the capability state for operators and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityReport {
    pub probed_at: Option<DateTime<Utc>>,
    pub probe_interval_secs: u64,
    pub fallback_transitions: u64,
    pub algorithms: Vec<AlgorithmReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlgorithmReport {
    pub algorithm: Algorithm,
    pub state: PrimitiveState,
    pub active_implementation: Implementation,
    pub primary_backend: String,
    pub fallback_backend: String,
    pub public_key_len: usize,
    pub secret_key_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphertext_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_len: Option<usize>,
    pub seed_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Exercises each primary implementation end-to-end and records the outcome.
pub struct CapabilityProbe {
    context: Arc<CapabilityContext>,
    kem: Arc<KeyEncapsulationService>,
    dsa: Arc<SignatureService>,
}

impl CapabilityProbe {
    pub fn new(
        context: Arc<CapabilityContext>,
        kem: Arc<KeyEncapsulationService>,
        dsa: Arc<SignatureService>,
    ) -> Self {
        Self { context, kem, dsa }
    }

    /// Probe if the interval has elapsed; otherwise return the cached snapshot.
    /// Never fails: a broken primary is recorded, not propagated.
    pub fn probe(&self) -> Arc<CapabilitySet> {
        let snapshot = self.context.snapshot();
        if !snapshot.probe_due(Utc::now()) {
            return snapshot;
        }
        self.force_probe()
    }

    /// Probe regardless of the interval. The probe is stamped with its start
    /// time so the next one falls due a full interval later.
    pub fn force_probe(&self) -> Arc<CapabilitySet> {
        let started = Utc::now();
        if self.context.state(Algorithm::Kem) != PrimitiveState::Unavailable {
            match self.kem.self_test() {
                Ok(()) => self.context.mark_available(Algorithm::Kem),
                Err(reason) => self.kem.demote(&reason),
            }
        }

        if self.context.state(Algorithm::Dsa) != PrimitiveState::Unavailable {
            match self.dsa.self_test() {
                Ok(()) => self.context.mark_available(Algorithm::Dsa),
                Err(reason) => self.dsa.demote(&reason),
            }
        }

        self.context.record_probe(started);
        let snapshot = self.context.snapshot();
        debug!(
            kem = ?snapshot.kem.state,
            dsa = ?snapshot.dsa.state,
            "Capability probe complete"
        );
        snapshot
    }

    /// Re-probe on every tick of the configured interval until the handle is
    /// aborted. The ticker owns the schedule, so each tick forces a probe.
    pub fn spawn_periodic(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.context.snapshot().probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.force_probe();
            }
        })
    }

    pub fn report(&self) -> CapabilityReport {
        let snapshot = self.context.snapshot();
        info!(
            kem = snapshot.active_implementation(Algorithm::Kem).name(),
            dsa = snapshot.active_implementation(Algorithm::Dsa).name(),
            "Capability report requested"
        );

        let kem = AlgorithmReport {
            algorithm: Algorithm::Kem,
            state: snapshot.kem.state,
            active_implementation: snapshot.active_implementation(Algorithm::Kem),
            primary_backend: self.kem.primary_name().to_string(),
            fallback_backend: self.kem.fallback_name().to_string(),
            public_key_len: ML_KEM_768.public_key_len,
            secret_key_len: ML_KEM_768.secret_key_len,
            ciphertext_len: Some(ML_KEM_768.ciphertext_len),
            shared_secret_len: Some(ML_KEM_768.shared_secret_len),
            signature_len: None,
            seed_len: ML_KEM_768.seed_len,
            reason: snapshot.kem.reason.clone(),
        };

        let dsa = AlgorithmReport {
            algorithm: Algorithm::Dsa,
            state: snapshot.dsa.state,
            active_implementation: snapshot.active_implementation(Algorithm::Dsa),
            primary_backend: self.dsa.primary_name().to_string(),
            fallback_backend: self.dsa.fallback_name().to_string(),
            public_key_len: ML_DSA_65.public_key_len,
            secret_key_len: ML_DSA_65.secret_key_len,
            ciphertext_len: None,
            shared_secret_len: None,
            signature_len: Some(ML_DSA_65.signature_len),
            seed_len: ML_DSA_65.seed_len,
            reason: snapshot.dsa.reason.clone(),
        };

        CapabilityReport {
            probed_at: snapshot.probed_at,
            probe_interval_secs: snapshot.probe_interval.as_secs(),
            fallback_transitions: snapshot.fallback_transitions,
            algorithms: vec![kem, dsa],
        }
    }
}
