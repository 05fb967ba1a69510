use crate::crd::{is_valid_fingerprint, SignalProcessingSpec};

/* ============================= TYPES ============================= */

/// Result of evaluating a SignalProcessing object against admission checks.
#[derive(Debug, Clone)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub message: Option<String>,
    pub violations: Vec<String>,
}

impl AdmissionVerdict {
    fn from_violations(violations: Vec<String>) -> Self {
        if violations.is_empty() {
            Self {
                allowed: true,
                message: None,
                violations,
            }
        } else {
            Self {
                allowed: false,
                message: Some(format_denial_message(&violations)),
                violations,
            }
        }
    }
}

/* ============================= CREATE ============================= */

/// Validate a SignalProcessing spec at admission time.
///
/// Collects every violation so the denial message names them all; an empty
/// or malformed fingerprint must never reach the reconciler.
pub fn validate_create(spec: &SignalProcessingSpec) -> AdmissionVerdict {
    let mut violations = Vec::new();

    if spec.signal.fingerprint.is_empty() {
        violations.push("signal.fingerprint is empty".to_string());
    } else if !is_valid_fingerprint(&spec.signal.fingerprint) {
        violations.push(format!(
            "signal.fingerprint must be 64 hex characters, got {} characters",
            spec.signal.fingerprint.len()
        ));
    }

    if spec.signal.name.is_empty() {
        violations.push("signal.name is empty".to_string());
    }

    if spec.signal.target_resource.kind.is_empty() {
        violations.push("signal.targetResource.kind is empty".to_string());
    }
    if spec.signal.target_resource.name.is_empty() {
        violations.push("signal.targetResource.name is empty".to_string());
    }
    if spec.signal.target_resource.namespace.is_empty() {
        violations.push("signal.targetResource.namespace is empty".to_string());
    }

    if spec.remediation_request_ref.name.is_empty() {
        violations.push("remediationRequestRef.name is empty".to_string());
    }

    AdmissionVerdict::from_violations(violations)
}

/* ============================= UPDATE ============================= */

/// The spec is immutable after creation; any change on UPDATE is denied.
/// Status-only updates pass through.
pub fn validate_update(
    old: &SignalProcessingSpec,
    new: &SignalProcessingSpec,
) -> AdmissionVerdict {
    let mut violations = Vec::new();
    if old != new {
        violations.push("spec is immutable after creation".to_string());
    }
    AdmissionVerdict::from_violations(violations)
}

/* ============================= MESSAGES ============================= */

pub fn format_denial_message(violations: &[String]) -> String {
    format!("Denied by SignalProcessing admission: {}", violations.join(", "))
}

/* ============================= TESTS ============================= */
