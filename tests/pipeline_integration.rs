mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use signalproc::audit::{
    EventOutcome, EVENT_CLASSIFICATION_DECISION, EVENT_ENRICHMENT_COMPLETED,
    EVENT_ERROR_OCCURRED, EVENT_PHASE_TRANSITION, EVENT_SIGNAL_PROCESSED,
};
use signalproc::crd::{
    condition_is_true, DeterminationSource, OwnerLink, Phase, Priority, SignalMode,
    SignalSeverity, CONDITION_CATEGORIZATION_COMPLETE, CONDITION_CLASSIFICATION_COMPLETE,
    CONDITION_ENRICHMENT_COMPLETE, CONDITION_PROCESSING_COMPLETE, CONDITION_READY,
};
use signalproc::pipeline::{PhaseError, StepOutcome};

// ══════════════════════════════════════════════════════════════════
// Pipeline integration tests (no cluster required)
//
// Drives the phase machine end-to-end against a fake cluster and a
// recording audit sink: the production-P0 path, degraded completion,
// fatal enrichment, predictive normalization, transient backoff and
// concurrent processing.
// ══════════════════════════════════════════════════════════════════

const ALL_CONDITIONS: [&str; 5] = [
    CONDITION_ENRICHMENT_COMPLETE,
    CONDITION_CLASSIFICATION_COMPLETE,
    CONDITION_CATEGORIZATION_COMPLETE,
    CONDITION_PROCESSING_COMPLETE,
    CONDITION_READY,
];

#[tokio::test]
async fn test_production_critical_pod_is_p0() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster = FakeCluster::new()
        .with_namespace("production", &[("environment", "production")])
        .with_workload("production", "api-server-xyz");
    let pipeline = build_pipeline(dir.path(), cluster, sink.clone(), None);

    let mut sp = make_sp("p0", "production", "Pod", "api-server-xyz", "critical", "OOMKilled");
    let phase = pipeline.process(&mut sp).await.unwrap();
    drain_audit(&pipeline).await;

    assert_eq!(phase, Phase::Completed);

    let status = sp.status.unwrap();
    let environment = status.environment_classification.unwrap();
    assert_eq!(environment.environment, "production");
    assert_eq!(environment.source, DeterminationSource::NamespaceLabels);
    assert_eq!(status.priority_assignment.unwrap().priority, Priority::P0);
    assert_eq!(status.severity, Some(SignalSeverity::Critical));
    assert!(!status.kubernetes_context.unwrap().degraded_mode);

    // Exactly 4 successful phase transitions and one signal.processed
    let correlation = "rr-p0";
    let transitions: Vec<_> = sink
        .events_for(correlation)
        .into_iter()
        .filter(|e| {
            e.event_type == EVENT_PHASE_TRANSITION && e.event_outcome == EventOutcome::Success
        })
        .collect();
    assert_eq!(transitions.len(), 4);

    let processed = sink.events_of_type(EVENT_SIGNAL_PROCESSED);
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].event_data["environment"], "production");
    assert_eq!(processed[0].event_data["priority"], "P0");
}

#[tokio::test]
async fn test_staging_warning_deployment_is_p2() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster = FakeCluster::new()
        .with_namespace("staging", &[("environment", "staging")])
        .with_workload("staging", "web-frontend");
    let pipeline = build_pipeline(dir.path(), cluster, sink.clone(), None);

    let mut sp = make_sp(
        "p2",
        "staging",
        "Deployment",
        "web-frontend",
        "warning",
        "HighLatency",
    );
    let phase = pipeline.process(&mut sp).await.unwrap();
    drain_audit(&pipeline).await;

    assert_eq!(phase, Phase::Completed);

    let status = sp.status.unwrap();
    assert_eq!(
        status.environment_classification.unwrap().environment,
        "staging"
    );
    assert_eq!(status.priority_assignment.unwrap().priority, Priority::P2);

    let decisions = sink.events_of_type(EVENT_CLASSIFICATION_DECISION);
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].event_data["environment"], "staging");
    assert_eq!(decisions[0].event_data["priority"], "P2");
    assert_eq!(decisions[0].event_data["normalized_severity"], "warning");
}

#[tokio::test]
async fn test_missing_target_pod_completes_degraded() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster =
        FakeCluster::new().with_namespace("production", &[("environment", "production")]);
    let pipeline = build_pipeline(dir.path(), cluster, sink.clone(), None);

    let mut sp = make_sp(
        "degraded",
        "production",
        "Pod",
        "non-existent-pod",
        "critical",
        "OOMKilled",
    );
    let phase = pipeline.process(&mut sp).await.unwrap();
    drain_audit(&pipeline).await;

    assert_eq!(phase, Phase::Completed);

    let status = sp.status.unwrap();
    assert!(status.kubernetes_context.unwrap().degraded_mode);
    assert_eq!(status.consecutive_failures, 0);

    // Degraded completion: exactly one signal.processed carrying the flag,
    // no error.occurred
    let processed = sink.events_of_type(EVENT_SIGNAL_PROCESSED);
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].event_data["degraded_mode"], true);
    assert!(sink.events_of_type(EVENT_ERROR_OCCURRED).is_empty());

    let enriched = sink.events_of_type(EVENT_ENRICHMENT_COMPLETED);
    assert_eq!(enriched.len(), 1);
    assert_eq!(enriched[0].event_data["has_pod"], false);
    assert_eq!(enriched[0].event_data["degraded_mode"], true);
}

#[tokio::test]
async fn test_missing_namespace_fails_in_enriching() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let pipeline = build_pipeline(dir.path(), FakeCluster::new(), sink.clone(), None);

    let mut sp = make_sp(
        "fatal",
        "non-existent-namespace-fatal",
        "Pod",
        "api-1",
        "critical",
        "OOMKilled",
    );
    let phase = pipeline.process(&mut sp).await.unwrap();
    drain_audit(&pipeline).await;

    assert_eq!(phase, Phase::Failed);

    let status = sp.status.unwrap();
    assert!(status
        .error
        .as_ref()
        .unwrap()
        .contains("non-existent-namespace-fatal"));

    let errors = sink.events_of_type(EVENT_ERROR_OCCURRED);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].event_outcome, EventOutcome::Failure);
    assert_eq!(errors[0].event_data["phase"], "Enriching");
    assert!(errors[0].event_data["error"]
        .as_str()
        .unwrap()
        .contains("non-existent-namespace-fatal"));

    // The failing transition is recorded with outcome=failure
    let failed_transitions: Vec<_> = sink
        .events_of_type(EVENT_PHASE_TRANSITION)
        .into_iter()
        .filter(|e| e.event_outcome == EventOutcome::Failure)
        .collect();
    assert_eq!(failed_transitions.len(), 1);
    assert_eq!(failed_transitions[0].event_data["to"], "Failed");

    // No signal.processed for a failed SP
    assert!(sink.events_of_type(EVENT_SIGNAL_PROCESSED).is_empty());
}

#[tokio::test]
async fn test_predictive_normalization() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster = FakeCluster::new()
        .with_namespace("production", &[("environment", "production")])
        .with_workload("production", "api-1");
    let pipeline = build_pipeline(dir.path(), cluster, sink.clone(), None);

    let mut sp = make_sp(
        "predictive",
        "production",
        "Pod",
        "api-1",
        "critical",
        "PredictedOOMKill",
    );
    pipeline.process(&mut sp).await.unwrap();
    drain_audit(&pipeline).await;

    let status = sp.status.unwrap();
    assert_eq!(status.signal_mode, Some(SignalMode::Predictive));
    assert_eq!(status.signal_type.as_deref(), Some("OOMKilled"));
    assert_eq!(
        status.original_signal_type.as_deref(),
        Some("PredictedOOMKill")
    );

    // Condition message carries the structured normalization context
    let classification = status
        .conditions
        .iter()
        .find(|c| c.condition_type == CONDITION_CLASSIFICATION_COMPLETE)
        .unwrap();
    assert!(classification.message.contains("signalMode=predictive"));
    assert!(classification.message.contains("original=PredictedOOMKill"));
    assert!(classification.message.contains("normalized=OOMKilled"));

    let decisions = sink.events_of_type(EVENT_CLASSIFICATION_DECISION);
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].event_data["signal_mode"], "predictive");
    assert_eq!(
        decisions[0].event_data["original_signal_type"],
        "PredictedOOMKill"
    );
}

#[tokio::test]
async fn test_reactive_signal_passes_through() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster = FakeCluster::new()
        .with_namespace("production", &[("environment", "production")])
        .with_workload("production", "api-1");
    let pipeline = build_pipeline(dir.path(), cluster, sink, None);

    let mut sp = make_sp("reactive", "production", "Pod", "api-1", "critical", "OOMKilled");
    pipeline.process(&mut sp).await.unwrap();

    let status = sp.status.unwrap();
    assert_eq!(status.signal_mode, Some(SignalMode::Reactive));
    assert_eq!(status.signal_type.as_deref(), Some("OOMKilled"));
    assert!(status.original_signal_type.is_none());
}

#[tokio::test]
async fn test_conditions_all_true_at_completed() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster = FakeCluster::new()
        .with_namespace("production", &[("environment", "production")])
        .with_workload("production", "api-1");
    let pipeline = build_pipeline(dir.path(), cluster, sink, None);

    let mut sp = make_sp("conds", "production", "Pod", "api-1", "critical", "OOMKilled");
    pipeline.process(&mut sp).await.unwrap();

    let status = sp.status.unwrap();
    // The condition set is a subset of the five known types
    for condition in &status.conditions {
        assert!(
            ALL_CONDITIONS.contains(&condition.condition_type.as_str()),
            "unexpected condition {}",
            condition.condition_type
        );
    }
    // And at Completed all five exist with status True
    for condition_type in ALL_CONDITIONS {
        assert!(
            condition_is_true(&status.conditions, condition_type),
            "{condition_type} should be True"
        );
    }
}

#[tokio::test]
async fn test_owner_chain_capped_at_five() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let chain: Vec<OwnerLink> = (0..5)
        .map(|n| OwnerLink {
            kind: "ReplicaSet".to_string(),
            name: format!("owner-{n}"),
            uid: format!("uid-{n}"),
        })
        .collect();
    let cluster = FakeCluster::new()
        .with_namespace("production", &[("environment", "production")])
        .with_workload("production", "api-1")
        .with_owner_chain(chain);
    let pipeline = build_pipeline(dir.path(), cluster, sink, None);

    let mut sp = make_sp("chain", "production", "Pod", "api-1", "critical", "OOMKilled");
    pipeline.process(&mut sp).await.unwrap();

    let context = sp.status.unwrap().kubernetes_context.unwrap();
    assert!(context.owner_chain.len() <= 5);
    assert_eq!(context.owner_chain.len(), 5);
    assert_eq!(context.owner_chain[0].name, "owner-0");
}

#[tokio::test]
async fn test_completed_sp_is_frozen_on_rereconcile() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster = FakeCluster::new()
        .with_namespace("production", &[("environment", "production")])
        .with_workload("production", "api-1");
    let pipeline = build_pipeline(dir.path(), cluster, sink.clone(), None);

    let mut sp = make_sp("frozen", "production", "Pod", "api-1", "critical", "OOMKilled");
    pipeline.process(&mut sp).await.unwrap();
    drain_audit(&pipeline).await;
    let events_before = sink.events().len();

    // Re-reconciling a Completed SP writes nothing and emits nothing
    for _ in 0..3 {
        assert!(matches!(
            pipeline.step(&sp).await.unwrap(),
            StepOutcome::Frozen
        ));
    }
    drain_audit(&pipeline).await;
    assert_eq!(sink.events().len(), events_before);
}

#[tokio::test]
async fn test_transient_failures_backoff_then_recover() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster = FakeCluster::new()
        .with_namespace("production", &[("environment", "production")])
        .with_workload("production", "api-1")
        .with_transient_failures(2);
    let pipeline = build_pipeline(dir.path(), cluster, sink.clone(), None);

    let mut sp = make_sp("retry", "production", "Pod", "api-1", "critical", "OOMKilled");

    // Pending → Enriching
    match pipeline.step(&sp).await.unwrap() {
        StepOutcome::Updated { status, .. } => sp.status = Some(status),
        StepOutcome::Frozen => panic!("pending must advance"),
    }

    // Two transient failures: the counter climbs, the phase stays put
    for expected_failures in 1..=2 {
        let err = pipeline.step(&sp).await.unwrap_err();
        assert!(matches!(err, PhaseError::Transient(_)));

        let status = pipeline.transient_failure_status(&sp, &err);
        assert_eq!(status.consecutive_failures, expected_failures);
        assert_eq!(status.phase, Some(Phase::Enriching));
        assert!(status.last_failure_time.is_some());

        let backoff = pipeline.backoff_for(expected_failures);
        assert!(backoff <= Duration::from_secs(1u64 << (expected_failures - 1)));

        sp.status = Some(status);
    }

    // Third attempt succeeds and the counter resets on the advance
    let phase = pipeline.process(&mut sp).await.unwrap();
    assert_eq!(phase, Phase::Completed);
    let status = sp.status.unwrap();
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.last_failure_time.is_none());

    drain_audit(&pipeline).await;
    assert!(sink.events_of_type(EVENT_ERROR_OCCURRED).is_empty());
}

#[tokio::test]
async fn test_concurrent_sps_complete_with_unique_events() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let mut cluster =
        FakeCluster::new().with_namespace("production", &[("environment", "production")]);
    for n in 0..10 {
        cluster = cluster.with_workload("production", &format!("api-{n}"));
    }
    let pipeline = Arc::new(build_pipeline(dir.path(), cluster, sink.clone(), None));

    let handles: Vec<_> = (0..10)
        .map(|n| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                let mut sp = make_sp(
                    &format!("sp-{n}"),
                    "production",
                    "Pod",
                    &format!("api-{n}"),
                    "critical",
                    "OOMKilled",
                );
                pipeline.process(&mut sp).await.unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Phase::Completed);
    }
    drain_audit(&pipeline).await;

    // No two events share an eventId
    let events = sink.events();
    let mut ids: Vec<_> = events.iter().map(|e| e.event_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), events.len());

    // Per-SP event counts match the completed-pipeline shape
    for n in 0..10 {
        let correlation = format!("rr-sp-{n}");
        let per_sp = sink.events_for(&correlation);
        let transitions = per_sp
            .iter()
            .filter(|e| {
                e.event_type == EVENT_PHASE_TRANSITION
                    && e.event_outcome == EventOutcome::Success
            })
            .count();
        let processed = per_sp
            .iter()
            .filter(|e| e.event_type == EVENT_SIGNAL_PROCESSED)
            .count();
        assert_eq!(transitions, 4, "SP {n} should emit 4 transitions");
        assert_eq!(processed, 1, "SP {n} should emit 1 signal.processed");
    }
}

#[tokio::test]
async fn test_event_timestamps_non_decreasing_per_correlation() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster = FakeCluster::new()
        .with_namespace("production", &[("environment", "production")])
        .with_workload("production", "api-1");
    let pipeline = build_pipeline(dir.path(), cluster, sink.clone(), None);

    let mut sp = make_sp("order", "production", "Pod", "api-1", "critical", "OOMKilled");
    pipeline.process(&mut sp).await.unwrap();
    drain_audit(&pipeline).await;

    let events = sink.events_for("rr-order");
    assert!(events.len() >= 7);
    for pair in events.windows(2) {
        assert!(
            pair[0].event_timestamp <= pair[1].event_timestamp,
            "timestamps must be non-decreasing in emission order"
        );
    }
}

#[tokio::test]
async fn test_recovery_context_populates_status() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let cluster = FakeCluster::new()
        .with_namespace("production", &[("environment", "production")])
        .with_workload("production", "api-1");
    let recovery = signalproc::crd::RecoveryContext {
        attempt_count: 2,
        previous_remediation_id: Some("rem-9".to_string()),
        last_failure_reason: Some("workflow timeout".to_string()),
        time_since_first_failure: Some("7200s".to_string()),
    };
    let pipeline = build_pipeline(dir.path(), cluster, sink, Some(recovery));

    let mut sp = make_sp("recovery", "production", "Pod", "api-1", "critical", "OOMKilled");
    pipeline.process(&mut sp).await.unwrap();

    let context = sp.status.unwrap().recovery_context.unwrap();
    assert_eq!(context.attempt_count, 2);
    assert_eq!(context.previous_remediation_id.as_deref(), Some("rem-9"));
}

#[tokio::test]
async fn test_invalid_spec_fails_without_enrichment() {
    let dir = tempfile::tempdir().unwrap();
    write_default_policies(dir.path());
    let sink = RecordingSink::new();
    let pipeline = build_pipeline(dir.path(), FakeCluster::new(), sink.clone(), None);

    let mut sp = make_sp("invalid", "production", "Pod", "api-1", "critical", "OOMKilled");
    sp.spec.signal.fingerprint = "short".to_string();

    let phase = pipeline.process(&mut sp).await.unwrap();
    drain_audit(&pipeline).await;

    assert_eq!(phase, Phase::Failed);
    assert!(sp.status.unwrap().error.unwrap().contains("fingerprint"));

    let errors = sink.events_of_type(EVENT_ERROR_OCCURRED);
    assert_eq!(errors.len(), 1);
}
