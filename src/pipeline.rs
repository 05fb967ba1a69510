use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditEmitter, AuditEvent, ClassificationDecision, EventOutcome};
use crate::business;
use crate::classify::{Classifiers, ClassifyError};
use crate::config::{BusinessPattern, ControllerConfig};
use crate::crd::{
    self, KubernetesContext, Phase, SignalProcessing, SignalProcessingSpec,
    SignalProcessingStatus, CONDITION_CATEGORIZATION_COMPLETE, CONDITION_CLASSIFICATION_COMPLETE,
    CONDITION_ENRICHMENT_COMPLETE, CONDITION_PROCESSING_COMPLETE, CONDITION_READY,
};
use crate::enrich::{EnrichError, EnrichmentSource};
use crate::policy::PolicyError;
use crate::recovery::RecoveryLookup;

/* ============================= ERRORS ============================= */

/// Closed error taxonomy of the reconciler. Invalid and Policy are terminal;
/// Transient retries with backoff; Conflict refetches and retries the
/// current reconcile.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("invalid: {0}")]
    Invalid(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("policy: {0}")]
    Policy(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl PhaseError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseError::Invalid(_) | PhaseError::Policy(_))
    }
}

impl From<ClassifyError> for PhaseError {
    fn from(e: ClassifyError) -> Self {
        match e {
            // Hot-reload races can briefly leave the store mid-swap; a plain
            // evaluation error against a loaded policy is terminal.
            ClassifyError::Policy(PolicyError::Read { .. }) => PhaseError::Transient(e.to_string()),
            _ => PhaseError::Policy(e.to_string()),
        }
    }
}

/* ============================= BACKOFF ============================= */

#[derive(Debug, Clone)]
pub struct BackoffSettings {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

impl From<&ControllerConfig> for BackoffSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

/* ============================= OUTCOME ============================= */

#[derive(Debug)]
pub enum StepOutcome {
    /// Write this status, then requeue after the given delay (immediately
    /// for the next phase, never for terminal phases).
    Updated {
        status: SignalProcessingStatus,
        requeue: Option<Duration>,
    },
    /// Terminal phases are frozen: no status write, no audit events.
    Frozen,
}

/* ============================= PIPELINE ============================= */

/// Phase state machine of the SignalProcessing reconciler. `step` computes
/// the next status for the SP's current phase; Kubernetes I/O happens only
/// through the enrichment and recovery seams, so the machine runs unchanged
/// against fakes.
pub struct Pipeline {
    enricher: Arc<dyn EnrichmentSource>,
    recovery: Arc<dyn RecoveryLookup>,
    classifiers: Classifiers,
    business_patterns: Vec<BusinessPattern>,
    audit: Arc<AuditEmitter>,
    backoff: BackoffSettings,
}

impl Pipeline {
    pub fn new(
        enricher: Arc<dyn EnrichmentSource>,
        recovery: Arc<dyn RecoveryLookup>,
        classifiers: Classifiers,
        business_patterns: Vec<BusinessPattern>,
        audit: Arc<AuditEmitter>,
        backoff: BackoffSettings,
    ) -> Self {
        Self {
            enricher,
            recovery,
            classifiers,
            business_patterns,
            audit,
            backoff,
        }
    }

    pub fn audit(&self) -> &Arc<AuditEmitter> {
        &self.audit
    }

    /// Advance the SP by one phase.
    ///
    /// Terminal failures (invalid spec, fatal enrichment, policy errors) are
    /// absorbed into a Failed status with exactly one error.occurred event;
    /// only retryable errors surface to the caller.
    pub async fn step(&self, sp: &SignalProcessing) -> Result<StepOutcome, PhaseError> {
        let current = sp
            .status
            .clone()
            .unwrap_or_default();
        let phase = current.phase.unwrap_or_default();
        let correlation = sp.spec.remediation_request_ref.name.clone();

        if phase.is_terminal() {
            return Ok(StepOutcome::Frozen);
        }

        if let Err(reason) = crd::validate_spec(&sp.spec) {
            return Ok(self.fail(&correlation, current, phase, &PhaseError::Invalid(reason)));
        }

        match phase {
            Phase::Pending => Ok(self.step_pending(&correlation, current)),
            Phase::Enriching => self.step_enriching(sp, &correlation, current).await,
            Phase::Classifying => self.step_classifying(&sp.spec, &correlation, current),
            Phase::Categorizing => self.step_categorizing(&sp.spec, &correlation, current).await,
            Phase::Completed | Phase::Failed => Ok(StepOutcome::Frozen),
        }
    }

    fn step_pending(
        &self,
        correlation: &str,
        mut status: SignalProcessingStatus,
    ) -> StepOutcome {
        let now = now_rfc3339();
        status.phase = Some(Phase::Enriching);
        crd::upsert_condition(
            &mut status.conditions,
            CONDITION_READY,
            false,
            "Processing",
            "signal processing started",
            &now,
        );
        reset_failures(&mut status);

        self.audit.append(AuditEvent::phase_transition(
            correlation,
            Phase::Pending.as_str(),
            Phase::Enriching.as_str(),
            EventOutcome::Success,
        ));

        StepOutcome::Updated {
            status,
            requeue: Some(Duration::ZERO),
        }
    }

    async fn step_enriching(
        &self,
        sp: &SignalProcessing,
        correlation: &str,
        mut status: SignalProcessingStatus,
    ) -> Result<StepOutcome, PhaseError> {
        let started = Instant::now();
        let target = &sp.spec.signal.target_resource;

        let enrichment = match self.enricher.enrich(target).await {
            Ok(enrichment) => enrichment,
            Err(e) if e.is_fatal() => {
                let error = PhaseError::Invalid(e.to_string());
                return Ok(self.fail(correlation, status, Phase::Enriching, &error));
            }
            Err(EnrichError::Transient(message)) => {
                return Err(PhaseError::Transient(message));
            }
            Err(e) => return Err(PhaseError::Transient(e.to_string())),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let now = now_rfc3339();

        let context = KubernetesContext {
            namespace: enrichment.namespace,
            workload: enrichment.workload,
            owner_chain: enrichment.owner_chain,
            custom_labels: Default::default(),
            degraded_mode: enrichment.degraded,
        };

        let message = format!(
            "namespace={}, workload={}, ownerChain={}, degraded={}",
            context.namespace.name,
            context
                .workload
                .as_ref()
                .map(|w| w.name.as_str())
                .unwrap_or("<missing>"),
            context.owner_chain.len(),
            context.degraded_mode,
        );

        self.audit.append(AuditEvent::enrichment_completed(
            correlation,
            true,
            context.workload.is_some(),
            context.degraded_mode,
            duration_ms,
        ));
        self.audit.append(AuditEvent::phase_transition(
            correlation,
            Phase::Enriching.as_str(),
            Phase::Classifying.as_str(),
            EventOutcome::Success,
        ));

        status.kubernetes_context = Some(context);
        status.phase = Some(Phase::Classifying);
        crd::upsert_condition(
            &mut status.conditions,
            CONDITION_ENRICHMENT_COMPLETE,
            true,
            "Enriched",
            &message,
            &now,
        );
        reset_failures(&mut status);

        Ok(StepOutcome::Updated {
            status,
            requeue: Some(Duration::ZERO),
        })
    }

    fn step_classifying(
        &self,
        spec: &SignalProcessingSpec,
        correlation: &str,
        mut status: SignalProcessingStatus,
    ) -> Result<StepOutcome, PhaseError> {
        let Some(mut context) = status.kubernetes_context.clone() else {
            let error =
                PhaseError::Invalid("classifying without enrichment context".to_string());
            return Ok(self.fail(correlation, status, Phase::Classifying, &error));
        };

        let outcome: Result<_, ClassifyError> = (|| {
            let severity = self.classifiers.severity(&spec.signal.severity)?;
            let mode = self.classifiers.signal_mode(&spec.signal.signal_type);
            let environment = self.classifiers.environment(&context.namespace)?;
            let priority = self
                .classifiers
                .priority(severity.severity, &environment.environment)?;
            let document = enrichment_document(spec, &context);
            let (labels, _labels_hash) = self.classifiers.custom_labels(&document)?;
            Ok((severity, mode, environment, priority, labels))
        })();

        let (severity, mode, environment, priority, labels) = match outcome {
            Ok(decisions) => decisions,
            Err(e) => {
                let error = PhaseError::from(e);
                if error.is_terminal() {
                    return Ok(self.fail(correlation, status, Phase::Classifying, &error));
                }
                return Err(error);
            }
        };

        let now = now_rfc3339();
        let message = match &mode.original_signal_type {
            Some(original) => format!(
                "signalMode=predictive, original={original}, normalized={}, severity={}, environment={}, priority={}",
                mode.signal_type,
                severity.severity.as_str(),
                environment.environment,
                priority.priority.as_str(),
            ),
            None => format!(
                "signalMode=reactive, severity={}, environment={}, priority={}",
                severity.severity.as_str(),
                environment.environment,
                priority.priority.as_str(),
            ),
        };

        self.audit.append(AuditEvent::classification_decision(
            correlation,
            &ClassificationDecision {
                external_severity: spec.signal.severity.clone(),
                normalized_severity: severity.severity.as_str().to_string(),
                environment: environment.environment.clone(),
                priority: priority.priority.as_str().to_string(),
                signal_mode: mode.mode.as_str().to_string(),
                original_signal_type: mode.original_signal_type.clone(),
                determination_source: environment.source.as_str().to_string(),
                policy_hash: priority.policy_hash.clone(),
            },
        ));
        self.audit.append(AuditEvent::phase_transition(
            correlation,
            Phase::Classifying.as_str(),
            Phase::Categorizing.as_str(),
            EventOutcome::Success,
        ));

        context.custom_labels = labels;
        status.kubernetes_context = Some(context);
        status.severity = Some(severity.severity);
        status.signal_type = Some(mode.signal_type);
        status.signal_mode = Some(mode.mode);
        status.original_signal_type = mode.original_signal_type;
        status.environment_classification = Some(crate::crd::EnvironmentClassification {
            environment: environment.environment,
            source: environment.source,
        });
        status.priority_assignment = Some(crate::crd::PriorityAssignment {
            priority: priority.priority,
            source: priority.source,
        });
        status.phase = Some(Phase::Categorizing);
        crd::upsert_condition(
            &mut status.conditions,
            CONDITION_CLASSIFICATION_COMPLETE,
            true,
            "Classified",
            &message,
            &now,
        );
        reset_failures(&mut status);

        Ok(StepOutcome::Updated {
            status,
            requeue: Some(Duration::ZERO),
        })
    }

    async fn step_categorizing(
        &self,
        spec: &SignalProcessingSpec,
        correlation: &str,
        mut status: SignalProcessingStatus,
    ) -> Result<StepOutcome, PhaseError> {
        let namespace = status
            .kubernetes_context
            .as_ref()
            .map(|c| c.namespace.clone())
            .unwrap_or_default();

        let classification = business::classify(&namespace, &self.business_patterns);

        // Parent-not-found (and any read failure) is never fatal here; the
        // SP completes without recovery context.
        let recovery = match self
            .recovery
            .recovery_context(&spec.remediation_request_ref)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!(
                    parent = %spec.remediation_request_ref.name,
                    error = %e,
                    "recovery_context_unavailable"
                );
                None
            }
        };

        let now = now_rfc3339();
        let degraded = status
            .kubernetes_context
            .as_ref()
            .is_some_and(|c| c.degraded_mode);

        self.audit.append(AuditEvent::business_classified(
            correlation,
            json!({
                "business_unit": classification.business_unit,
                "service_owner": classification.service_owner,
                "criticality": classification.criticality,
                "sla": classification.sla,
            }),
        ));
        self.audit.append(AuditEvent::phase_transition(
            correlation,
            Phase::Categorizing.as_str(),
            Phase::Completed.as_str(),
            EventOutcome::Success,
        ));
        self.audit.append(AuditEvent::signal_processed(
            correlation,
            json!({
                "fingerprint": spec.signal.fingerprint,
                "signal_name": spec.signal.name,
                "severity": status.severity.map(|s| s.as_str()),
                "environment": status
                    .environment_classification
                    .as_ref()
                    .map(|e| e.environment.clone()),
                "priority": status.priority_assignment.as_ref().map(|p| p.priority.as_str()),
                "signal_mode": status.signal_mode.map(|m| m.as_str()),
                "degraded_mode": degraded,
            }),
        ));

        status.business_classification = Some(classification);
        status.recovery_context = recovery;
        status.phase = Some(Phase::Completed);
        crd::upsert_condition(
            &mut status.conditions,
            CONDITION_CATEGORIZATION_COMPLETE,
            true,
            "Categorized",
            "business classification and recovery context resolved",
            &now,
        );
        crd::upsert_condition(
            &mut status.conditions,
            CONDITION_PROCESSING_COMPLETE,
            true,
            "Complete",
            "all phases completed",
            &now,
        );
        crd::upsert_condition(
            &mut status.conditions,
            CONDITION_READY,
            true,
            "Complete",
            "signal processed",
            &now,
        );
        reset_failures(&mut status);

        info!(correlation_id = correlation, "signal_processing_completed");

        Ok(StepOutcome::Updated {
            status,
            requeue: None,
        })
    }

    /// Terminal failure: Failed status, the failing phase's condition set
    /// False, exactly one error.occurred event plus the failing transition.
    fn fail(
        &self,
        correlation: &str,
        mut status: SignalProcessingStatus,
        phase: Phase,
        error: &PhaseError,
    ) -> StepOutcome {
        let now = now_rfc3339();
        let reason = error.to_string();

        self.audit
            .append(AuditEvent::error_occurred(correlation, phase.as_str(), &reason));
        self.audit.append(AuditEvent::phase_transition(
            correlation,
            phase.as_str(),
            Phase::Failed.as_str(),
            EventOutcome::Failure,
        ));

        let failed_condition = match phase {
            Phase::Enriching => Some((CONDITION_ENRICHMENT_COMPLETE, "EnrichmentFailed")),
            Phase::Classifying => Some((CONDITION_CLASSIFICATION_COMPLETE, "ClassificationFailed")),
            Phase::Categorizing => {
                Some((CONDITION_CATEGORIZATION_COMPLETE, "CategorizationFailed"))
            }
            _ => None,
        };
        if let Some((condition_type, condition_reason)) = failed_condition {
            crd::upsert_condition(
                &mut status.conditions,
                condition_type,
                false,
                condition_reason,
                &reason,
                &now,
            );
        }
        crd::upsert_condition(
            &mut status.conditions,
            CONDITION_READY,
            false,
            "Failed",
            &reason,
            &now,
        );

        status.phase = Some(Phase::Failed);
        status.error = Some(reason.clone());

        warn!(correlation_id = correlation, phase = %phase, error = %reason, "signal_processing_failed");

        StepOutcome::Updated {
            status,
            requeue: None,
        }
    }

    /// Status mutation for a retryable failure: bump the counter, stamp the
    /// failure time. The phase does not move.
    pub fn transient_failure_status(
        &self,
        sp: &SignalProcessing,
        error: &PhaseError,
    ) -> SignalProcessingStatus {
        let mut status = sp.status.clone().unwrap_or_default();
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        status.last_failure_time = Some(now_rfc3339());
        warn!(
            correlation_id = %sp.spec.remediation_request_ref.name,
            consecutive_failures = status.consecutive_failures,
            error = %error,
            "signal_processing_transient_failure"
        );
        status
    }

    /// Shared exponential backoff: base doubling per failure, capped, with
    /// full jitter.
    pub fn backoff_for(&self, consecutive_failures: i32) -> Duration {
        let exponent = consecutive_failures.clamp(1, 20) as u32 - 1;
        let ceiling = self
            .backoff
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.backoff.cap);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }

    /// Run phases until the SP freezes. Used by clusterless tests and the
    /// reconcile loop never calls it; the controller advances one phase per
    /// reconcile.
    pub async fn process(&self, sp: &mut SignalProcessing) -> Result<Phase, PhaseError> {
        loop {
            match self.step(sp).await? {
                StepOutcome::Updated { status, .. } => {
                    let phase = status.phase.unwrap_or_default();
                    sp.status = Some(status);
                    if phase.is_terminal() {
                        return Ok(phase);
                    }
                }
                StepOutcome::Frozen => {
                    return Ok(sp
                        .status
                        .as_ref()
                        .and_then(|s| s.phase)
                        .unwrap_or_default());
                }
            }
        }
    }
}

/* ============================= HELPERS ============================= */

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn reset_failures(status: &mut SignalProcessingStatus) {
    status.consecutive_failures = 0;
    status.last_failure_time = None;
}

/// Input document handed to the custom-labels policy: the signal plus the
/// full enrichment context.
fn enrichment_document(spec: &SignalProcessingSpec, context: &KubernetesContext) -> Value {
    json!({
        "signal": {
            "name": spec.signal.name,
            "type": spec.signal.signal_type,
            "severity": spec.signal.severity,
            "source": spec.signal.source,
            "labels": spec.signal.labels,
        },
        "namespace": {
            "name": context.namespace.name,
            "labels": context.namespace.labels,
            "annotations": context.namespace.annotations,
        },
        "workload": context.workload,
        "ownerChain": context.owner_chain,
        "degradedMode": context.degraded_mode,
    })
}

/* ============================= TESTS ============================= */
