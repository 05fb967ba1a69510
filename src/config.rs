use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/* ============================= DOCUMENT ============================= */

/// Controller configuration, loaded from a YAML document (typically a mounted
/// ConfigMap). Every field has a default so an empty document is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Directory holding the policy source files (severity.rego,
    /// environment.rego, priority.rego, labels.rego).
    pub policy_dir: PathBuf,

    /// Coalescing window for policy hot reload, clamped to [200, 2000].
    pub policy_reload_interval_ms: u64,

    /// Predictive signal type normalization table (type → normalized type).
    pub signal_normalization: BTreeMap<String, String>,

    /// Namespace-name patterns that fill business classification gaps.
    pub business_patterns: Vec<BusinessPattern>,

    pub audit: AuditConfig,
    pub enrichment: EnrichmentConfig,
    pub controller: ControllerConfig,

    /// Bind address for the /healthz, /readyz and /metrics server.
    pub metrics_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy_dir: PathBuf::from("/etc/signalproc/policies"),
            policy_reload_interval_ms: 500,
            signal_normalization: default_signal_normalization(),
            business_patterns: Vec::new(),
            audit: AuditConfig::default(),
            enrichment: EnrichmentConfig::default(),
            controller: ControllerConfig::default(),
            metrics_addr: "0.0.0.0:9090".to_string(),
        }
    }
}

fn default_signal_normalization() -> BTreeMap<String, String> {
    [
        ("PredictedOOMKill", "OOMKilled"),
        ("PredictedCrashLoop", "CrashLoopBackOff"),
        ("PredictedDiskPressure", "DiskPressure"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Fills business classification fields for namespaces matching a pattern
/// when the namespace carries no explicit labels.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BusinessPattern {
    /// Glob over the namespace name, e.g. "payments-*".
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditConfig {
    /// DataStorage base URL.
    pub endpoint: String,
    /// Background flush period. The reconcile path never waits on this.
    pub flush_interval_ms: u64,
    /// Write attempts before a batch is dropped.
    pub max_attempts: u32,
    /// Base delay for the capped exponential write retry.
    pub retry_base_ms: u64,
    /// Buffered events beyond this are dropped oldest-first.
    pub buffer_capacity: usize,
    /// Deadline for the final drain on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://datastorage:8085".to_string(),
            flush_interval_ms: 1000,
            max_attempts: 3,
            retry_base_ms: 100,
            buffer_capacity: 4096,
            shutdown_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnrichmentConfig {
    /// Per-call Kubernetes API deadline.
    pub api_timeout_ms: u64,
    /// Attempts per call before a transient error is surfaced.
    pub max_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            api_timeout_ms: 2000,
            max_attempts: 3,
            retry_base_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Base delay of the shared exponential backoff (factor 2, full jitter).
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1000,
            backoff_cap_ms: 300_000,
        }
    }
}

/* ============================= LOADING ============================= */

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&bytes).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Reload interval clamped to the supported coalescing window.
    pub fn policy_reload_interval(&self) -> Duration {
        Duration::from_millis(self.policy_reload_interval_ms.clamp(200, 2000))
    }
}

/* ============================= TESTS ============================= */
