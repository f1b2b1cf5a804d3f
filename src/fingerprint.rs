//! Compatibility fingerprints for workers and work items.
//!
//! A worker's advertised configuration and an item's required parameters are
//! both reduced to a [`CapabilitySet`], canonicalized (trimmed, lowercased,
//! plugins deduplicated and sorted, keys emitted in sorted order) and hashed
//! with SHA-256. Two configurations that differ only in field order, plugin
//! order, or letter case produce the same [`Fingerprint`].
//!
//! Sampling settings and seeds are deliberately left out: they change what a
//! worker generates, not whether it can serve the request.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FingerprintError;

/// Prefix mixed into every digest so a future canonical format can coexist.
const CANONICAL_VERSION: &str = "compat-v1";

/// Model identity and context limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub max_input_length: u32,
    pub max_total_length: u32,
}

/// Configuration a worker advertises when it connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default = "default_parallel_requests")]
    pub max_parallel_requests: u32,
}

fn default_parallel_requests() -> u32 {
    1
}

/// Sampling settings for one generation. Not part of the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SamplingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
}

/// What a work item needs from the worker that generates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkParameters {
    pub model: ModelConfig,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub sampling: SamplingParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Hex-encoded SHA-256 digest of a canonical capability set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a previously computed digest (e.g. loaded from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized capability fields shared by worker configs and work parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    model_id: String,
    max_input_length: u32,
    max_total_length: u32,
    plugins: BTreeSet<String>,
}

impl CapabilitySet {
    /// Validate and normalize the capability fields.
    pub fn new(model: &ModelConfig, plugins: &[String]) -> Result<Self, FingerprintError> {
        let model_id = model.model_id.trim().to_lowercase();
        if model_id.is_empty() {
            return Err(invalid("model.model_id", "must not be empty"));
        }
        if model.max_input_length == 0 {
            return Err(invalid("model.max_input_length", "must be positive"));
        }
        if model.max_total_length == 0 {
            return Err(invalid("model.max_total_length", "must be positive"));
        }
        if model.max_input_length > model.max_total_length {
            return Err(invalid(
                "model.max_input_length",
                "must not exceed max_total_length",
            ));
        }

        let mut normalized = BTreeSet::new();
        for (i, plugin) in plugins.iter().enumerate() {
            let name = plugin.trim().to_lowercase();
            if name.is_empty() {
                return Err(invalid(&format!("plugins[{i}]"), "must not be empty"));
            }
            normalized.insert(name);
        }

        Ok(Self {
            model_id,
            max_input_length: model.max_input_length,
            max_total_length: model.max_total_length,
            plugins: normalized,
        })
    }

    /// Canonical string form: a JSON object whose keys are in sorted order.
    pub fn canonical(&self) -> String {
        let mut fields: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        fields.insert("max_input_length", self.max_input_length.into());
        fields.insert("max_total_length", self.max_total_length.into());
        fields.insert("model_id", self.model_id.clone().into());
        fields.insert(
            "plugins",
            self.plugins.iter().cloned().collect::<Vec<_>>().into(),
        );
        // BTreeMap serialization preserves key order; values are plain scalars/arrays.
        let body = serde_json::to_string(&fields).unwrap_or_default();
        format!("{CANONICAL_VERSION}:{body}")
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(self.canonical().as_bytes());
        Fingerprint(hex::encode(digest))
    }
}

impl WorkerConfig {
    pub fn capabilities(&self) -> Result<CapabilitySet, FingerprintError> {
        if self.max_parallel_requests == 0 {
            return Err(invalid("max_parallel_requests", "must be positive"));
        }
        CapabilitySet::new(&self.model, &self.plugins)
    }

    /// Fingerprint of what this worker can serve.
    pub fn fingerprint(&self) -> Result<Fingerprint, FingerprintError> {
        Ok(self.capabilities()?.fingerprint())
    }
}

impl WorkParameters {
    pub fn capabilities(&self) -> Result<CapabilitySet, FingerprintError> {
        CapabilitySet::new(&self.model, &self.plugins)
    }

    /// Fingerprint a worker must match to serve this item.
    pub fn fingerprint(&self) -> Result<Fingerprint, FingerprintError> {
        Ok(self.capabilities()?.fingerprint())
    }
}

fn invalid(field: &str, reason: &str) -> FingerprintError {
    FingerprintError::InvalidConfiguration {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
