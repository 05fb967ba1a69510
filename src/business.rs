use crate::config::BusinessPattern;
use crate::crd::{BusinessClassification, NamespaceInfo};
use crate::policy::glob_match;

/* ============================= LABELS ============================= */

pub const LABEL_BUSINESS_UNIT: &str = "kubernaut.ai/business-unit";
pub const LABEL_SERVICE_OWNER: &str = "kubernaut.ai/service-owner";
pub const LABEL_CRITICALITY: &str = "kubernaut.ai/criticality";
pub const LABEL_SLA: &str = "kubernaut.ai/sla";

/* ============================= CLASSIFICATION ============================= */

/// Populate business classification from namespace labels, then fill gaps
/// from the first matching namespace-name pattern. Missing fields are left
/// empty; this is never an error.
pub fn classify(namespace: &NamespaceInfo, patterns: &[BusinessPattern]) -> BusinessClassification {
    let label = |key: &str| namespace.labels.get(key).filter(|v| !v.is_empty()).cloned();

    let mut classification = BusinessClassification {
        business_unit: label(LABEL_BUSINESS_UNIT),
        service_owner: label(LABEL_SERVICE_OWNER),
        criticality: label(LABEL_CRITICALITY),
        sla: label(LABEL_SLA),
    };

    if let Some(pattern) = patterns
        .iter()
        .find(|p| glob_match(&p.pattern, &namespace.name))
    {
        if classification.business_unit.is_none() {
            classification.business_unit = pattern.business_unit.clone();
        }
        if classification.criticality.is_none() {
            classification.criticality = pattern.criticality.clone();
        }
        if classification.sla.is_none() {
            classification.sla = pattern.sla.clone();
        }
    }

    classification
}

/* ============================= TESTS ============================= */
