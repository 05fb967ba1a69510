use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, Histogram, HistogramVec, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use signalproc::audit::{AuditEmitter, EmitterSettings, HttpAuditSink};
use signalproc::classify::Classifiers;
use signalproc::config::Config;
use signalproc::crd::{Phase, SignalProcessing, SignalProcessingStatus};
use signalproc::enrich::K8sEnricher;
use signalproc::pipeline::{BackoffSettings, PhaseError, Pipeline, StepOutcome};
use signalproc::policy::{PolicyStore, RuleEngine};
use signalproc::recovery::K8sRecoveryResolver;

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "signalprocessing_reconcile_total",
        "Total SignalProcessing reconciliation passes",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "signalprocessing_reconcile_errors_total",
        "Total SignalProcessing reconciliation errors",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static PHASE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let h = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "signalprocessing_phase_duration_seconds",
            "Duration of one reconcile pass per phase",
        ),
        &["phase"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

static CLASSIFY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "signalprocessing_classifier_duration_seconds",
        "Duration of the classification phase including policy evaluation",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

static SP_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "signalprocessing_completed_total",
        "SignalProcessing resources that reached Completed",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static SP_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "signalprocessing_failed_total",
        "SignalProcessing resources that reached terminal Failed",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static AUDIT_BUFFER_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "signalprocessing_audit_buffer_depth",
        "Audit events currently buffered",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static AUDIT_WRITE_FAILURES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "signalprocessing_audit_write_failures_total",
        "Failed audit batch write attempts",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static AUDIT_EVENTS_DROPPED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "signalprocessing_audit_events_dropped_total",
        "Audit events dropped after retry exhaustion or overflow",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

fn sync_audit_metrics(emitter: &AuditEmitter) {
    AUDIT_BUFFER_DEPTH.set(emitter.buffer_depth() as i64);
    AUDIT_WRITE_FAILURES.set(emitter.write_failures_total() as i64);
    AUDIT_EVENTS_DROPPED.set(emitter.dropped_total() as i64);
}

/* ============================= STATE ============================= */

pub(crate) struct RunState {
    pub(crate) ready: bool,
}

/* ============================= CONTEXT ============================= */

struct RunContext {
    client: Client,
    pipeline: Pipeline,
}

/* ============================= ENTRY ============================= */

pub async fn run(config_path: Option<&str>) -> Result<()> {
    println!("Starting SignalProcessing controller...\n");

    let config = match config_path {
        Some(path) => Config::load(Path::new(path))?,
        None => Config::default(),
    };

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    // Verify actual cluster connectivity before starting the controller
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    // A missing required policy is a fatal boot misconfiguration
    print!("  Policy store ................ ");
    let store = match PolicyStore::load(&config.policy_dir, Box::new(RuleEngine)) {
        Ok(store) => {
            println!("OK ({})", config.policy_dir.display());
            Arc::new(store)
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Policy store boot failed: {e}");
        }
    };

    let sink = Arc::new(HttpAuditSink::new(config.audit.endpoint.clone()));
    let emitter = Arc::new(AuditEmitter::new(
        sink,
        EmitterSettings::from(&config.audit),
    ));

    let classifiers = Classifiers::new(Arc::clone(&store), config.signal_normalization.clone());
    let pipeline = Pipeline::new(
        Arc::new(K8sEnricher::new(client.clone(), &config.enrichment)),
        Arc::new(K8sRecoveryResolver::new(client.clone())),
        classifiers,
        config.business_patterns.clone(),
        Arc::clone(&emitter),
        BackoffSettings::from(&config.controller),
    );

    // Force-init Prometheus metrics so they appear on /metrics
    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&PHASE_DURATION);
    LazyLock::force(&CLASSIFY_DURATION);
    LazyLock::force(&SP_COMPLETED);
    LazyLock::force(&SP_FAILED);
    LazyLock::force(&AUDIT_BUFFER_DEPTH);
    LazyLock::force(&AUDIT_WRITE_FAILURES);
    LazyLock::force(&AUDIT_EVENTS_DROPPED);

    let addr: SocketAddr = config
        .metrics_addr
        .parse()
        .context("Invalid metrics address")?;

    println!("  CRD watch ................... SignalProcessing.kubernaut.ai/v1");
    println!("  Audit endpoint .............. {}", config.audit.endpoint);
    println!(
        "  Policy reload window ........ {}ms",
        config.policy_reload_interval().as_millis()
    );
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!(
        "    GET /readyz ............... Readiness probe (503 until first reconcile, then 200)"
    );
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Controller running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("signalprocessing_controller_started");

    let run_state = Arc::new(Mutex::new(RunState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let flusher_handle = emitter.spawn_flusher(shutdown_tx.subscribe());
    let reload_handle = Arc::clone(&store).spawn_reload_loop(
        config.policy_reload_interval(),
        Some(Arc::clone(&emitter)),
        shutdown_tx.subscribe(),
    );

    let http_state = run_state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle =
        tokio::spawn(async move { start_metrics_server(http_state, http_shutdown, addr).await });

    let metrics_emitter = Arc::clone(&emitter);
    let mut metrics_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = metrics_shutdown.recv() => return,
                _ = ticker.tick() => sync_audit_metrics(&metrics_emitter),
            }
        }
    });

    let sps: Api<SignalProcessing> = Api::all(client.clone());
    let ctx = Arc::new(RunContext {
        client: client.clone(),
        pipeline,
    });

    let controller_state = run_state.clone();
    let controller = Controller::new(sps, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                // Mark ready after first reconcile dispatch
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                if let Err(e) = result {
                    warn!(error = %e, "reconcile_dispatch_error");
                }
            }
        });

    // Ctrl+C drops the controller stream; the kube Controller has no
    // built-in shutdown hook.
    tokio::select! {
        _ = controller => {
            info!("controller_stream_ended");
            println!("\nController stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping controller...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;
    let _ = reload_handle.await;
    // The flusher drains the audit buffer under its shutdown deadline
    let _ = flusher_handle.await;

    let dropped = emitter.dropped_total();
    if dropped > 0 {
        println!("Audit events dropped this run: {dropped}");
    }

    info!("signalprocessing_controller_stopped");
    println!("Controller stopped.");

    Ok(())
}

/* ============================= RECONCILE ============================= */

async fn reconcile(
    sp: Arc<SignalProcessing>,
    ctx: Arc<RunContext>,
) -> std::result::Result<Action, kube::Error> {
    let name = sp.name_any();
    let namespace = sp.namespace().unwrap_or_default();
    let correlation = sp.spec.remediation_request_ref.name.clone();
    let phase = sp.status.as_ref().and_then(|s| s.phase).unwrap_or_default();
    let consecutive_failures = sp
        .status
        .as_ref()
        .map(|s| s.consecutive_failures)
        .unwrap_or_default();

    RECONCILE_TOTAL.inc();

    info!(
        sp = %format!("{namespace}/{name}"),
        correlation_id = %correlation,
        phase = %phase,
        consecutive_failures,
        "reconcile_start"
    );

    let phase_timer = PHASE_DURATION
        .with_label_values(&[phase.as_str()])
        .start_timer();
    let classify_timer =
        matches!(phase, Phase::Classifying).then(|| CLASSIFY_DURATION.start_timer());

    let outcome = ctx.pipeline.step(&sp).await;

    drop(classify_timer);
    drop(phase_timer);
    sync_audit_metrics(ctx.pipeline.audit());

    match outcome {
        Ok(StepOutcome::Frozen) => Ok(Action::await_change()),

        Ok(StepOutcome::Updated { status, requeue }) => {
            let next_phase = status.phase.unwrap_or_default();

            match patch_status(&ctx.client, &namespace, &name, &status).await {
                Ok(()) => {}
                // Optimistic concurrency conflict: refetch and retry now
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    let conflict = PhaseError::Conflict(err.message);
                    info!(
                        sp = %format!("{namespace}/{name}"),
                        correlation_id = %correlation,
                        error = %conflict,
                        "status_conflict_retrying"
                    );
                    return Ok(Action::requeue(Duration::ZERO));
                }
                Err(e) => return Err(e),
            }

            match next_phase {
                Phase::Completed => SP_COMPLETED.inc(),
                Phase::Failed => {
                    SP_FAILED.inc();
                    RECONCILE_ERRORS.inc();
                }
                _ => {}
            }

            info!(
                sp = %format!("{namespace}/{name}"),
                correlation_id = %correlation,
                phase = %next_phase,
                "status_updated"
            );

            Ok(requeue
                .map(Action::requeue)
                .unwrap_or_else(Action::await_change))
        }

        Err(error) => {
            RECONCILE_ERRORS.inc();
            let status = ctx.pipeline.transient_failure_status(&sp, &error);
            let failures = status.consecutive_failures;

            match patch_status(&ctx.client, &namespace, &name, &status).await {
                Ok(()) => {}
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    return Ok(Action::requeue(Duration::ZERO));
                }
                Err(e) => return Err(e),
            }

            let backoff = ctx.pipeline.backoff_for(failures);
            warn!(
                sp = %format!("{namespace}/{name}"),
                correlation_id = %correlation,
                phase = %phase,
                consecutive_failures = failures,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "reconcile_retrying_with_backoff"
            );
            Ok(Action::requeue(backoff))
        }
    }
}

async fn patch_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &SignalProcessingStatus,
) -> std::result::Result<(), kube::Error> {
    let api: Api<SignalProcessing> = Api::namespaced(client.clone(), namespace);
    api.patch_status(
        name,
        &PatchParams::apply("signalprocessing-controller"),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/* ============================= ERROR POLICY ============================= */

fn error_policy(
    _sp: Arc<SignalProcessing>,
    error: &kube::Error,
    _ctx: Arc<RunContext>,
) -> Action {
    RECONCILE_ERRORS.inc();
    warn!(error = %error, "reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_run_router(state: Arc<Mutex<RunState>>) -> Router {
    Router::new()
        .route("/metrics", get(run_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || run_ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(
    state: Arc<Mutex<RunState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_run_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    info!(addr = %addr, "metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn run_ready_handler(state: Arc<Mutex<RunState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn run_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_run_state(ready: bool) -> Arc<Mutex<RunState>> {
        Arc::new(Mutex::new(RunState { ready }))
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let app = build_run_router(test_run_state(false));
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_when_ready() {
        let app = build_run_router(test_run_state(true));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"READY");
    }

    #[tokio::test]
    async fn test_readyz_when_not_ready() {
        let app = build_run_router(test_run_state(false));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"NOT READY");
    }

    #[tokio::test]
    async fn test_metrics_returns_ok() {
        let app = build_run_router(test_run_state(false));
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let app = build_run_router(test_run_state(false));
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_phase_duration_metric_registered() {
        LazyLock::force(&PHASE_DURATION);
        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(
            names.contains(&"signalprocessing_phase_duration_seconds"),
            "phase_duration_seconds should be registered"
        );
    }

    #[test]
    fn test_audit_metrics_registered() {
        LazyLock::force(&AUDIT_BUFFER_DEPTH);
        LazyLock::force(&AUDIT_EVENTS_DROPPED);
        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"signalprocessing_audit_buffer_depth"));
        assert!(names.contains(&"signalprocessing_audit_events_dropped_total"));
    }
}
