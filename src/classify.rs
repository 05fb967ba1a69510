use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use crate::crd::{DeterminationSource, NamespaceInfo, Priority, SignalMode, SignalSeverity};
use crate::policy::{PolicyError, PolicyKind, PolicyStore};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("{policy} policy returned unexpected value: {value}")]
    UnexpectedResult {
        policy: &'static str,
        value: String,
    },
}

/* ============================= DECISIONS ============================= */

#[derive(Debug, Clone, PartialEq)]
pub struct SeverityDecision {
    pub severity: SignalSeverity,
    pub policy_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalModeDecision {
    pub mode: SignalMode,
    pub signal_type: String,
    /// Set only when normalization changed the type.
    pub original_signal_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentDecision {
    pub environment: String,
    pub source: DeterminationSource,
    /// Absent when the decision came from namespace labels.
    pub policy_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriorityDecision {
    pub priority: Priority,
    /// "policy" for a rule hit, "fallback" for the policy default clause.
    pub source: String,
    pub policy_hash: String,
}

/* ============================= SIGNAL MODE ============================= */

/// Normalize a raw signal type through the configured mapping table.
///
/// A match yields predictive mode with the mapped type and the original
/// recorded; anything else passes through as reactive.
pub fn normalize_signal_type(
    normalization: &BTreeMap<String, String>,
    raw_type: &str,
) -> SignalModeDecision {
    match normalization.get(raw_type) {
        Some(mapped) if mapped != raw_type => SignalModeDecision {
            mode: SignalMode::Predictive,
            signal_type: mapped.clone(),
            original_signal_type: Some(raw_type.to_string()),
        },
        _ => SignalModeDecision {
            mode: SignalMode::Reactive,
            signal_type: raw_type.to_string(),
            original_signal_type: None,
        },
    }
}

/* ============================= CLASSIFIERS ============================= */

/// Thin policy-driven evaluators over the policy store. For fixed inputs and
/// a fixed policy hash, every decision is byte-identical.
pub struct Classifiers {
    store: Arc<PolicyStore>,
    normalization: BTreeMap<String, String>,
}

impl Classifiers {
    pub fn new(store: Arc<PolicyStore>, normalization: BTreeMap<String, String>) -> Self {
        Self {
            store,
            normalization,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Normalize the raw external severity through the severity policy.
    pub fn severity(&self, raw_severity: &str) -> Result<SeverityDecision, ClassifyError> {
        let input = json!({ "signal": { "severity": raw_severity } });
        let (verdict, policy_hash) = self.store.evaluate(PolicyKind::Severity, &input)?;

        let severity = verdict
            .value
            .as_str()
            .and_then(SignalSeverity::parse)
            .ok_or_else(|| ClassifyError::UnexpectedResult {
                policy: "severity",
                value: verdict.value.to_string(),
            })?;

        Ok(SeverityDecision {
            severity,
            policy_hash,
        })
    }

    pub fn signal_mode(&self, raw_type: &str) -> SignalModeDecision {
        normalize_signal_type(&self.normalization, raw_type)
    }

    /// Classify the environment: namespace labels first, then the
    /// ConfigMap-driven rule set, else `unknown` with source `default`.
    pub fn environment(
        &self,
        namespace: &NamespaceInfo,
    ) -> Result<EnvironmentDecision, ClassifyError> {
        if let Some(label) = namespace.labels.get("environment")
            && !label.is_empty()
        {
            return Ok(EnvironmentDecision {
                environment: label.clone(),
                source: DeterminationSource::NamespaceLabels,
                policy_hash: None,
            });
        }

        let input = json!({
            "namespace": {
                "name": namespace.name,
                "labels": namespace.labels,
            }
        });
        let (verdict, policy_hash) = self.store.evaluate(PolicyKind::Environment, &input)?;

        let environment = verdict
            .value
            .as_str()
            .ok_or_else(|| ClassifyError::UnexpectedResult {
                policy: "environment",
                value: verdict.value.to_string(),
            })?
            .to_string();

        let source = if verdict.matched {
            DeterminationSource::Configmap
        } else {
            DeterminationSource::Default
        };

        Ok(EnvironmentDecision {
            environment,
            source,
            policy_hash: Some(policy_hash),
        })
    }

    /// Assign a priority from normalized severity and environment. The
    /// policy's default clause covers unknown environments.
    pub fn priority(
        &self,
        severity: SignalSeverity,
        environment: &str,
    ) -> Result<PriorityDecision, ClassifyError> {
        let input = json!({
            "severity": severity.as_str(),
            "environment": environment,
        });
        let (verdict, policy_hash) = self.store.evaluate(PolicyKind::Priority, &input)?;

        let priority = verdict
            .value
            .as_str()
            .and_then(Priority::parse)
            .ok_or_else(|| ClassifyError::UnexpectedResult {
                policy: "priority",
                value: verdict.value.to_string(),
            })?;

        Ok(PriorityDecision {
            priority,
            source: if verdict.matched { "policy" } else { "fallback" }.to_string(),
            policy_hash,
        })
    }

    /// Produce custom labels from the full enrichment document. Scalar rule
    /// results are coerced to single-element lists.
    pub fn custom_labels(
        &self,
        enrichment: &Value,
    ) -> Result<(BTreeMap<String, Vec<String>>, String), ClassifyError> {
        let (verdict, policy_hash) = self.store.evaluate(PolicyKind::CustomLabels, enrichment)?;

        let object = verdict
            .value
            .as_object()
            .ok_or_else(|| ClassifyError::UnexpectedResult {
                policy: "custom-labels",
                value: verdict.value.to_string(),
            })?;

        let mut labels = BTreeMap::new();
        for (key, value) in object {
            let values = match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                Value::String(s) => vec![s.clone()],
                other => {
                    return Err(ClassifyError::UnexpectedResult {
                        policy: "custom-labels",
                        value: other.to_string(),
                    });
                }
            };
            labels.insert(key.clone(), values);
        }

        Ok((labels, policy_hash))
    }
}

/* ============================= TESTS ============================= */
