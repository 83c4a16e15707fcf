/// Runtime configuration, loaded from a JSON file.
///
/// Every field has a default, so an empty object `{}` is a valid config.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::entropy::HttpEntropyConfig;
use crate::crypto::kdf::KdfParams;
use crate::error::{Result, VaultError};

const MAX_PROBE_INTERVAL_SECS: u64 = 24 * 60 * 60;
const MAX_PROOF_WINDOW_SECS: u64 = 24 * 60 * 60;
const MAX_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_KIT_VALIDITY_DAYS: u64 = 10 * 366;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub capability: CapabilityConfig,
    pub entropy: EntropyConfig,
    pub proof: ProofConfig,
    pub session: SessionConfig,
    pub recovery: RecoveryConfig,
    pub share_file: ShareFileConfig,
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| VaultError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        in_range(
            "capability.probe_interval_secs",
            self.capability.probe_interval_secs,
            1,
            MAX_PROBE_INTERVAL_SECS,
        )?;
        in_range("proof.freshness_secs", self.proof.freshness_secs, 1, MAX_PROOF_WINDOW_SECS)?;
        in_range("proof.future_skew_secs", self.proof.future_skew_secs, 0, MAX_PROOF_WINDOW_SECS)?;
        in_range("session.ttl_secs", self.session.ttl_secs, 1, MAX_SESSION_TTL_SECS)?;
        in_range(
            "recovery.kit_validity_days",
            self.recovery.kit_validity_days,
            1,
            MAX_KIT_VALIDITY_DAYS,
        )?;
        Ok(())
    }
}

fn in_range(field: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(VaultError::Config(format!("{field} must be in {min}..={max}, got {value}")));
    }
    Ok(())
}

/// Capability probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub probe_interval_secs: u64,
    /// Run the probe on a background interval.
    pub periodic: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 60,
            periodic: false,
        }
    }
}

impl CapabilityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// Remote entropy sources mixed into key generation seeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    pub sources: Vec<HttpEntropyConfig>,
    pub timeout_ms: u64,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            timeout_ms: 3_000,
        }
    }
}

impl EntropyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Identity proofs at device registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofConfig {
    pub required: bool,
    pub freshness_secs: u64,
    pub future_skew_secs: u64,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            required: false,
            freshness_secs: 300,
            future_skew_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 15 * 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Days a distributed kit stays recoverable.
    pub kit_validity_days: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            kit_validity_days: 90,
        }
    }
}

impl RecoveryConfig {
    pub fn kit_validity(&self) -> Duration {
        Duration::from_secs(self.kit_validity_days.saturating_mul(24 * 60 * 60))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareFileConfig {
    pub kdf: KdfParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.capability.probe_interval(), Duration::from_secs(60));
        assert_eq!(config.proof.freshness_secs, 300);
        assert_eq!(config.share_file.kdf, KdfParams::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_sections() {
        let config: CoreConfig = serde_json::from_str(
            r#"{
                "capability": { "periodic": true },
                "entropy": {
                    "sources": [{
                        "name": "anu",
                        "url": "https://qrng.example/API/jsonI.php?length={len}&type=uint8",
                        "format": { "kind": "json_array", "field": "data" }
                    }]
                },
                "recovery": { "kit_validity_days": 7 }
            }"#,
        )
        .unwrap();
        assert!(config.capability.periodic);
        assert_eq!(config.capability.probe_interval_secs, 60);
        assert_eq!(config.entropy.sources.len(), 1);
        assert_eq!(config.entropy.timeout_ms, 3_000);
        assert_eq!(config.recovery.kit_validity(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut config = CoreConfig::default();
        config.session.ttl_secs = 10_000_000_000_000;
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));

        let mut config = CoreConfig::default();
        config.proof.future_skew_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));

        let mut config = CoreConfig::default();
        config.recovery.kit_validity_days = u64::MAX;
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));
        assert_eq!(config.recovery.kit_validity(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_load_and_validate() {
        let path = std::env::temp_dir().join(format!("pqvault-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "proof": { "freshness_secs": 0 } }"#).unwrap();
        assert!(matches!(CoreConfig::load(&path), Err(VaultError::Config(_))));

        std::fs::write(&path, r#"{ "recovery": { "kit_validity_days": 100000000 } }"#).unwrap();
        assert!(matches!(CoreConfig::load(&path), Err(VaultError::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(CoreConfig::load(&path), Err(VaultError::Config(_))));
        std::fs::remove_file(&path).unwrap();
    }
}
