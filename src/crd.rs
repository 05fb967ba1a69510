use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= PHASE ============================= */

/// Processing phase of a SignalProcessing resource.
///
/// Transitions are monotonic along Pending → Enriching → Classifying →
/// Categorizing → Completed. Any non-terminal phase may transition to Failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Pending,
    Enriching,
    Classifying,
    Categorizing,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Enriching => "Enriching",
            Phase::Classifying => "Classifying",
            Phase::Categorizing => "Categorizing",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
        }
    }

    /// Completed and Failed are frozen: no further status writes happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ============================= SIGNAL MODE & SEVERITY ============================= */

/// Signal mode: predictive signals carry a "Predicted" prefix and are
/// normalized to their reactive counterpart for downstream matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalMode {
    Reactive,
    Predictive,
}

impl SignalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalMode::Reactive => "reactive",
            SignalMode::Predictive => "predictive",
        }
    }
}

/// Normalized signal severity produced by the severity policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalSeverity {
    Critical,
    Warning,
    Info,
}

impl SignalSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSeverity::Critical => "critical",
            SignalSeverity::Warning => "warning",
            SignalSeverity::Info => "info",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "critical" => Some(SignalSeverity::Critical),
            "warning" => Some(SignalSeverity::Warning),
            "info" => Some(SignalSeverity::Info),
            _ => None,
        }
    }
}

/// Remediation priority assigned by the priority policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "P0" => Some(Priority::P0),
            "P1" => Some(Priority::P1),
            "P2" => Some(Priority::P2),
            "P3" => Some(Priority::P3),
            _ => None,
        }
    }
}

/* ============================= CONDITIONS ============================= */

pub const CONDITION_ENRICHMENT_COMPLETE: &str = "EnrichmentComplete";
pub const CONDITION_CLASSIFICATION_COMPLETE: &str = "ClassificationComplete";
pub const CONDITION_CATEGORIZATION_COMPLETE: &str = "CategorizationComplete";
pub const CONDITION_PROCESSING_COMPLETE: &str = "ProcessingComplete";
pub const CONDITION_READY: &str = "Ready";

/// A single status condition, mirroring the Kubernetes condition convention.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    /// "True" or "False".
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Insert or update a condition by type. The transition timestamp only moves
/// when the status value actually changes.
pub fn upsert_condition(
    conditions: &mut Vec<SignalCondition>,
    condition_type: &str,
    status: bool,
    reason: &str,
    message: &str,
    now: &str,
) {
    let status_str = if status { "True" } else { "False" };

    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status != status_str {
            existing.last_transition_time = Some(now.to_string());
        }
        existing.status = status_str.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        return;
    }

    conditions.push(SignalCondition {
        condition_type: condition_type.to_string(),
        status: status_str.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Some(now.to_string()),
    });
}

pub fn condition_is_true(conditions: &[SignalCondition], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.condition_type == condition_type && c.status == "True")
}

/* ============================= SPEC ============================= */

/// Reference to the resource that originated the signal.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetResource {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

/// The raw observability signal as received from the intake component.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    /// Stable 64-char hex identifier of the originating signal instance.
    pub fingerprint: String,
    pub name: String,
    /// Raw external severity string; normalized during classification.
    pub severity: String,
    /// Raw external signal type; normalized during classification.
    #[serde(rename = "type")]
    pub signal_type: String,
    pub source: String,
    pub target_type: String,
    pub target_resource: TargetResource,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// RFC 3339 timestamp at which the signal was received.
    pub received_time: String,
}

/// Reference to the parent remediation record. Required by schema; the
/// referenced record need not exist yet.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequestRef {
    pub name: String,
    pub namespace: String,
}

/// SignalProcessing transforms a raw observability signal into an enriched,
/// classified, prioritized remediation work item.
///
/// The spec is immutable after creation; all mutable state lives in status
/// and is owned exclusively by the reconciler.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "kubernaut.ai",
    version = "v1",
    kind = "SignalProcessing",
    plural = "signalprocessings",
    shortname = "sp",
    status = "SignalProcessingStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SignalProcessingSpec {
    pub signal: Signal,
    pub remediation_request_ref: RemediationRequestRef,
}

/* ============================= STATUS: CONTEXT BLOCKS ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResources {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadInfo {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerResources>,
}

/// One step of the controller owner chain, nearest-to-root.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OwnerLink {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// Enrichment output for the signal's target resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesContext {
    pub namespace: NamespaceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadInfo>,
    /// Controller owner references from the target outward, capped at 5.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_chain: Vec<OwnerLink>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_labels: BTreeMap<String, Vec<String>>,
    /// True when a non-namespace enrichment target was unreachable but
    /// processing continued.
    #[serde(default)]
    pub degraded_mode: bool,
}

/* ============================= STATUS: CLASSIFICATION BLOCKS ============================= */

/// Where a classification decision came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeterminationSource {
    NamespaceLabels,
    Configmap,
    Default,
}

impl DeterminationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeterminationSource::NamespaceLabels => "namespace-labels",
            DeterminationSource::Configmap => "configmap",
            DeterminationSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentClassification {
    pub environment: String,
    pub source: DeterminationSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriorityAssignment {
    pub priority: Priority,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BusinessClassification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<String>,
}

/// Retry history from the parent remediation record, populated only when the
/// parent reports at least one recovery attempt.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    pub attempt_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_remediation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_since_first_failure: Option<String>,
}

/* ============================= STATUS ============================= */

/// SignalProcessingStatus is owned by the reconciler and populated phase by
/// phase; downstream services consume it without recomputation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SignalProcessingStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SignalCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<SignalSeverity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_mode: Option<SignalMode>,

    /// Set only when predictive normalization changed the signal type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_signal_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_context: Option<KubernetesContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_classification: Option<EnvironmentClassification>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_assignment: Option<PriorityAssignment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_classification: Option<BusinessClassification>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_context: Option<RecoveryContext>,

    #[serde(default)]
    pub consecutive_failures: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<String>,

    /// Short human-readable reason, set only on terminal Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/* ============================= SPEC VALIDATION ============================= */

/// A fingerprint is a stable 64-char hex identifier.
pub fn is_valid_fingerprint(fingerprint: &str) -> bool {
    fingerprint.len() == 64 && fingerprint.chars().all(|c| c.is_ascii_hexdigit())
}

/// Validate the immutable spec fields the reconciler depends on.
///
/// Returns the first violation found; a failing spec is terminal.
pub fn validate_spec(spec: &SignalProcessingSpec) -> Result<(), String> {
    if spec.signal.fingerprint.is_empty() {
        return Err("signal.fingerprint must not be empty".to_string());
    }
    if !is_valid_fingerprint(&spec.signal.fingerprint) {
        return Err(format!(
            "signal.fingerprint must be 64 hex characters, got {} characters",
            spec.signal.fingerprint.len()
        ));
    }
    if spec.signal.name.is_empty() {
        return Err("signal.name must not be empty".to_string());
    }
    if spec.signal.target_resource.kind.is_empty()
        || spec.signal.target_resource.name.is_empty()
        || spec.signal.target_resource.namespace.is_empty()
    {
        return Err("signal.targetResource requires kind, name and namespace".to_string());
    }
    if spec.remediation_request_ref.name.is_empty() {
        return Err("remediationRequestRef.name must not be empty".to_string());
    }
    Ok(())
}

/* ============================= REMEDIATION REQUEST ============================= */

/// The parent remediation record, created by the upstream intake component.
/// This controller only reads it, to resolve recovery context.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "kubernaut.ai",
    version = "v1",
    kind = "RemediationRequest",
    plural = "remediationrequests",
    status = "RemediationRequestStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequestSpec {
    pub signal_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequestStatus {
    #[serde(default)]
    pub recovery_attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_remediation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    /// RFC 3339 timestamp of the first recorded failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure_time: Option<String>,
}

/* ============================= TESTS ============================= */
