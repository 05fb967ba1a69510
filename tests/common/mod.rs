#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use signalproc::audit::{AuditEmitter, AuditEvent, AuditSink, EmitterSettings, SinkError};
use signalproc::classify::Classifiers;
use signalproc::crd::{
    NamespaceInfo, OwnerLink, RecoveryContext, RemediationRequestRef, Signal, SignalProcessing,
    SignalProcessingSpec, TargetResource, WorkloadInfo,
};
use signalproc::enrich::{EnrichError, Enrichment, EnrichmentSource};
use signalproc::pipeline::{BackoffSettings, Pipeline};
use signalproc::policy::{content_hash, PolicyStore, RuleEngine};
use signalproc::recovery::{RecoveryError, RecoveryLookup};

/* ============================= POLICIES ============================= */

pub const SEVERITY_POLICY: &str = r#"
rules:
  - when: { signal.severity: [critical, fatal, P1] }
    emit: critical
  - when: { signal.severity: [warning, minor] }
    emit: warning
default: info
"#;

pub const ENVIRONMENT_POLICY: &str = r#"
rules:
  - when: { namespace.name: "prod-*" }
    emit: production
  - when: { namespace.name: "staging-*" }
    emit: staging
default: unknown
"#;

pub const PRIORITY_POLICY: &str = r#"
rules:
  - when: { severity: critical, environment: production }
    emit: P0
  - when: { severity: critical }
    emit: P1
  - when: { severity: warning, environment: production }
    emit: P1
  - when: { severity: warning, environment: staging }
    emit: P2
  - when: { severity: warning }
    emit: P2
default: P3
"#;

pub const LABELS_POLICY: &str = r#"
rules:
  - when: { namespace.labels.team: payments }
    emit:
      cost-center: ["cc-100"]
default: {}
"#;

pub fn write_default_policies(dir: &Path) {
    std::fs::write(dir.join("severity.rego"), SEVERITY_POLICY).unwrap();
    std::fs::write(dir.join("environment.rego"), ENVIRONMENT_POLICY).unwrap();
    std::fs::write(dir.join("priority.rego"), PRIORITY_POLICY).unwrap();
    std::fs::write(dir.join("labels.rego"), LABELS_POLICY).unwrap();
}

pub fn priority_policy_hash() -> String {
    content_hash(PRIORITY_POLICY.as_bytes())
}

/* ============================= FIXTURES ============================= */

/// Build a SignalProcessing with a deterministic 64-hex fingerprint.
pub fn make_sp(
    name: &str,
    namespace: &str,
    target_kind: &str,
    target_name: &str,
    severity: &str,
    signal_type: &str,
) -> SignalProcessing {
    let mut sp = SignalProcessing::new(
        name,
        SignalProcessingSpec {
            signal: Signal {
                fingerprint: content_hash(name.as_bytes()),
                name: format!("{signal_type}Alert"),
                severity: severity.to_string(),
                signal_type: signal_type.to_string(),
                source: "prometheus".to_string(),
                target_type: "kubernetes".to_string(),
                target_resource: TargetResource {
                    kind: target_kind.to_string(),
                    name: target_name.to_string(),
                    namespace: namespace.to_string(),
                },
                labels: BTreeMap::new(),
                received_time: "2026-03-01T10:00:00Z".to_string(),
            },
            remediation_request_ref: RemediationRequestRef {
                name: format!("rr-{name}"),
                namespace: namespace.to_string(),
            },
        },
    );
    sp.metadata.namespace = Some(namespace.to_string());
    sp
}

/* ============================= FAKE CLUSTER ============================= */

/// Clusterless enrichment source: a table of namespaces and workloads.
#[derive(Default)]
pub struct FakeCluster {
    pub namespaces: HashMap<String, BTreeMap<String, String>>,
    pub workloads: HashSet<(String, String)>,
    pub owner_chain: Vec<OwnerLink>,
    pub transient_failures: Mutex<u32>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, name: &str, labels: &[(&str, &str)]) -> Self {
        self.namespaces.insert(
            name.to_string(),
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn with_workload(mut self, namespace: &str, name: &str) -> Self {
        self.workloads
            .insert((namespace.to_string(), name.to_string()));
        self
    }

    pub fn with_owner_chain(mut self, chain: Vec<OwnerLink>) -> Self {
        self.owner_chain = chain;
        self
    }

    pub fn with_transient_failures(self, failures: u32) -> Self {
        *self.transient_failures.lock().unwrap() = failures;
        self
    }
}

#[async_trait]
impl EnrichmentSource for FakeCluster {
    async fn enrich(&self, target: &TargetResource) -> Result<Enrichment, EnrichError> {
        {
            let mut remaining = self.transient_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EnrichError::Transient("injected api failure".to_string()));
            }
        }

        let labels = self
            .namespaces
            .get(&target.namespace)
            .ok_or_else(|| EnrichError::NamespaceNotFound(target.namespace.clone()))?;

        let present = self
            .workloads
            .contains(&(target.namespace.clone(), target.name.clone()));

        Ok(Enrichment {
            namespace: NamespaceInfo {
                name: target.namespace.clone(),
                labels: labels.clone(),
                annotations: BTreeMap::new(),
            },
            workload: present.then(|| WorkloadInfo {
                kind: target.kind.clone(),
                name: target.name.clone(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                containers: Vec::new(),
            }),
            owner_chain: if present {
                self.owner_chain.clone()
            } else {
                Vec::new()
            },
            degraded: !present,
        })
    }
}

/* ============================= FAKE RECOVERY ============================= */

pub struct StaticRecovery(pub Option<RecoveryContext>);

#[async_trait]
impl RecoveryLookup for StaticRecovery {
    async fn recovery_context(
        &self,
        _parent: &RemediationRequestRef,
    ) -> Result<Option<RecoveryContext>, RecoveryError> {
        Ok(self.0.clone())
    }
}

/* ============================= RECORDING SINK ============================= */

pub struct RecordingSink {
    pub events: Mutex<Vec<AuditEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn events_for(&self, correlation_id: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.correlation_id == correlation_id)
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), SinkError> {
        self.events.lock().unwrap().extend(events.iter().cloned());
        Ok(())
    }
}

/* ============================= PIPELINE ASSEMBLY ============================= */

pub fn build_pipeline(
    policy_dir: &Path,
    cluster: FakeCluster,
    sink: Arc<RecordingSink>,
    recovery: Option<RecoveryContext>,
) -> Pipeline {
    let store = Arc::new(PolicyStore::load(policy_dir, Box::new(RuleEngine)).unwrap());
    let normalization: BTreeMap<String, String> =
        [("PredictedOOMKill", "OOMKilled"), ("PredictedCrashLoop", "CrashLoopBackOff")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

    Pipeline::new(
        Arc::new(cluster),
        Arc::new(StaticRecovery(recovery)),
        Classifiers::new(store, normalization),
        Vec::new(),
        Arc::new(AuditEmitter::new(sink, EmitterSettings::default())),
        BackoffSettings::default(),
    )
}

/// Drain the pipeline's audit buffer into the sink.
pub async fn drain_audit(pipeline: &Pipeline) {
    pipeline
        .audit()
        .flush(std::time::Duration::from_secs(1))
        .await
        .expect("audit flush should succeed against the recording sink");
}
