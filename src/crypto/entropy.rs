/// Seed material for key generation.
///
/// External randomness services (quantum RNG beacons, verifiable randomness
/// APIs) are mixed with a local OsRng sample:
///
/// 1. Draw `len` bytes from OsRng
/// 2. Query every configured source concurrently, bounded by a timeout
/// 3. XOR each successful response into the buffer
/// 4. Strengthen the combined buffer through the BLAKE3 derive-key XOF
///
/// Any subset of sources may be down. OsRng alone is an acceptable minimum,
/// so source failures are logged and never surfaced.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rand::RngCore;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::crypto::hash;
use crate::crypto::sensitive::SensitiveVec;
use crate::error::{Result, VaultError};

const STRENGTHEN_CONTEXT: &str = "pqvault 2024-06 entropy pool strengthen v1";

/// A remote source of random bytes.
#[async_trait]
pub trait EntropySource: Send + Sync {
    /// Human-readable name of this source (e.g., "anu-qrng").
    fn name(&self) -> &str;

    /// Fetch at least `len` random bytes.
    async fn fetch(&self, len: usize) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// How a source encodes its random bytes in the response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Body is the raw bytes.
    Raw,
    /// Body is a hex string.
    Hex,
    /// Body is JSON with a hex string under `field`.
    JsonHex { field: String },
    /// Body is JSON with an array of byte values under `field` (ANU QRNG style).
    JsonArray { field: String },
}

/// Configuration for one HTTP entropy source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEntropyConfig {
    pub name: String,
    /// URL; `{len}` is replaced by the requested byte count.
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub format: ResponseFormat,
}

/// Entropy source backed by an HTTP randomness service.
pub struct HttpEntropySource {
    client: Client,
    config: HttpEntropyConfig,
}

impl HttpEntropySource {
    pub fn new(config: HttpEntropyConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Config(format!("HTTP client for {}: {e}", config.name)))?;
        Ok(Self { client, config })
    }

    fn parse_body(&self, body: &[u8]) -> Result<Vec<u8>> {
        match &self.config.format {
            ResponseFormat::Raw => Ok(body.to_vec()),
            ResponseFormat::Hex => {
                let text = std::str::from_utf8(body)
                    .map_err(|e| VaultError::Entropy(format!("non-UTF-8 hex body: {e}")))?;
                hex::decode(text.trim()).map_err(|e| VaultError::Entropy(e.to_string()))
            }
            ResponseFormat::JsonHex { field } => {
                let value: serde_json::Value = serde_json::from_slice(body)?;
                let text = value
                    .get(field)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| VaultError::Entropy(format!("missing field {field}")))?;
                hex::decode(text).map_err(|e| VaultError::Entropy(e.to_string()))
            }
            ResponseFormat::JsonArray { field } => {
                let value: serde_json::Value = serde_json::from_slice(body)?;
                let items = value
                    .get(field)
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| VaultError::Entropy(format!("missing array {field}")))?;
                items
                    .iter()
                    .map(|v| {
                        v.as_u64()
                            .and_then(|n| u8::try_from(n).ok())
                            .ok_or_else(|| VaultError::Entropy("array value out of range".into()))
                    })
                    .collect()
            }
        }
    }
}

#[async_trait]
impl EntropySource for HttpEntropySource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn fetch(&self, len: usize) -> Result<Vec<u8>> {
        let url = self.config.url.replace("{len}", &len.to_string());
        let request = match self.config.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url).json(&serde_json::json!({ "length": len })),
        };

        let resp = request
            .send()
            .await
            .map_err(|e| VaultError::Entropy(format!("{}: {e}", self.config.name)))?;

        if !resp.status().is_success() {
            return Err(VaultError::Entropy(format!(
                "{} returned HTTP {}",
                self.config.name,
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| VaultError::Entropy(format!("{}: {e}", self.config.name)))?;

        self.parse_body(&body)
    }
}

/// Mixes remote sources with the local CSPRNG.
pub struct EntropyPool {
    sources: Vec<Arc<dyn EntropySource>>,
    timeout: Duration,
}

impl EntropyPool {
    pub fn new(sources: Vec<Arc<dyn EntropySource>>, timeout: Duration) -> Self {
        Self { sources, timeout }
    }

    /// Pool with no remote sources: OsRng only, strengthened.
    pub fn local_only() -> Self {
        Self::new(Vec::new(), Duration::from_secs(0))
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Gather `len` bytes of strengthened seed material.
    pub async fn gather(&self, len: usize) -> SensitiveVec {
        let mut combined = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut combined);

        let mixed = self.mix_sources(&mut combined).await;
        debug!(
            sources_mixed = mixed,
            sources_configured = self.sources.len(),
            "Entropy gathered"
        );

        let strengthened = hash::derive_secret_xof(STRENGTHEN_CONTEXT, &[&combined], len);
        combined.zeroize();
        strengthened
    }

    /// XOR every source that answers in time with enough bytes into `combined`.
    /// Returns how many sources were mixed.
    async fn mix_sources(&self, combined: &mut [u8]) -> usize {
        let len = combined.len();
        let fetches = self.sources.iter().map(|source| async move {
            let outcome = tokio::time::timeout(self.timeout, source.fetch(len)).await;
            (source.name().to_string(), outcome)
        });

        let mut mixed = 0usize;
        for (name, outcome) in join_all(fetches).await {
            match outcome {
                Ok(Ok(mut bytes)) if bytes.len() >= len => {
                    for (dst, src) in combined.iter_mut().zip(bytes.iter()) {
                        *dst ^= src;
                    }
                    bytes.zeroize();
                    mixed += 1;
                    debug!(source = %name, "Mixed entropy source");
                }
                Ok(Ok(mut bytes)) => {
                    warn!(
                        source = %name,
                        got = bytes.len(),
                        wanted = len,
                        "Entropy source returned too few bytes, skipping"
                    );
                    bytes.zeroize();
                }
                Ok(Err(e)) => {
                    warn!(source = %name, error = %e, "Entropy source failed, skipping");
                }
                Err(_) => {
                    warn!(source = %name, timeout_ms = self.timeout.as_millis() as u64, "Entropy source timed out, skipping");
                }
            }
        }

        mixed
    }

    /// Seed sized for ML-KEM-768 key generation.
    pub async fn kem_seed(&self) -> SensitiveVec {
        self.gather(crate::pq::ML_KEM_768.seed_len).await
    }

    /// Seed sized for ML-DSA-65 key generation.
    pub async fn dsa_seed(&self) -> SensitiveVec {
        self.gather(crate::pq::ML_DSA_65.seed_len).await
    }
}
