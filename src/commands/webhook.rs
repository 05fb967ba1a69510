use std::net::SocketAddr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::info;

use signalproc::admission::{self, AdmissionVerdict};
use signalproc::crd::SignalProcessing;

/* ============================= PROMETHEUS ============================= */

static WEBHOOK_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_requests_total", "Total admission webhook requests"),
        &["operation", "allowed"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DENIALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "webhook_denials_total",
            "Total admission webhook denials by namespace and reason",
        ),
        &["namespace", "reason"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "webhook_request_duration_seconds",
        "Duration of admission webhook request processing in seconds",
    ))
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/* ============================= ENTRY: SERVE ============================= */

pub async fn serve(addr_str: &str, tls_cert: &str, tls_key: &str) -> Result<()> {
    println!("Starting admission webhook server...\n");
    info!("webhook_starting");

    // Validate TLS certificate and key files exist
    print!("  TLS ......................... ");
    validate_tls_files(tls_cert, tls_key)?;
    println!("loaded ({}, {})", tls_cert, tls_key);

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    println!("  HTTPS server ................ https://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /validate ............ Admission review handler");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Admission webhook running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let tls_cert = tls_cert.to_string();
    let tls_key = tls_key.to_string();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle =
        tokio::spawn(
            async move { start_https_server(http_shutdown, addr, &tls_cert, &tls_key).await },
        );

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping webhook server...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("webhook_stopped");
    println!("Webhook server stopped.");
    Ok(())
}

/* ============================= TLS ============================= */

fn validate_tls_files(cert_path: &str, key_path: &str) -> Result<()> {
    if !std::path::Path::new(cert_path).exists() {
        anyhow::bail!("TLS certificate file not found: {}", cert_path);
    }
    if !std::path::Path::new(key_path).exists() {
        anyhow::bail!("TLS key file not found: {}", key_path);
    }
    Ok(())
}

/* ============================= HTTPS SERVER ============================= */

pub(crate) fn build_webhook_router() -> Router {
    Router::new()
        .route("/validate", post(admission_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/metrics", get(webhook_metrics_handler))
}

async fn start_https_server(
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) -> Result<()> {
    let app = build_webhook_router();

    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load TLS configuration")?;

    info!(addr = %addr, "https_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

async fn webhook_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = WEBHOOK_REGISTRY.gather();
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

/* ============================= ADMISSION HANDLER ============================= */

async fn admission_handler(body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let review: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "invalid_admission_review");
            return (
                StatusCode::BAD_REQUEST,
                build_admission_response("", true, None),
            );
        }
    };

    let uid = review["request"]["uid"].as_str().unwrap_or("").to_string();
    let operation = review["request"]["operation"]
        .as_str()
        .unwrap_or("UNKNOWN")
        .to_string();
    let namespace = review["request"]["namespace"]
        .as_str()
        .unwrap_or("default")
        .to_string();

    let verdict = evaluate_review(&review, &operation);

    let allowed_str = if verdict.allowed { "true" } else { "false" };
    WEBHOOK_REQUESTS
        .with_label_values(&[&operation, allowed_str])
        .inc();

    if !verdict.allowed {
        for violation in &verdict.violations {
            WEBHOOK_DENIALS
                .with_label_values(&[&namespace, denial_reason(violation)])
                .inc();
        }
        info!(
            namespace = %namespace,
            violations = ?verdict.violations,
            "admission_denied"
        );
    }

    (
        StatusCode::OK,
        build_admission_response(&uid, verdict.allowed, verdict.message.as_deref()),
    )
}

/// Validate the object in an AdmissionReview. Anything we cannot parse is
/// allowed (fail-open); the reconciler still rejects invalid specs terminally.
fn evaluate_review(review: &serde_json::Value, operation: &str) -> AdmissionVerdict {
    let object: SignalProcessing =
        match serde_json::from_value(review["request"]["object"].clone()) {
            Ok(sp) => sp,
            Err(e) => {
                info!(error = %e, "failed_to_parse_signalprocessing");
                return AdmissionVerdict {
                    allowed: true,
                    message: None,
                    violations: Vec::new(),
                };
            }
        };

    if operation == "UPDATE" {
        if let Ok(old) = serde_json::from_value::<SignalProcessing>(
            review["request"]["oldObject"].clone(),
        ) {
            let immutability = admission::validate_update(&old.spec, &object.spec);
            if !immutability.allowed {
                return immutability;
            }
        }
    }

    admission::validate_create(&object.spec)
}

fn denial_reason(violation: &str) -> &'static str {
    if violation.contains("fingerprint") {
        "fingerprint"
    } else if violation.contains("immutable") {
        "spec_immutable"
    } else if violation.contains("targetResource") {
        "target"
    } else {
        "invalid_spec"
    }
}

fn build_admission_response(uid: &str, allowed: bool, message: Option<&str>) -> String {
    let mut response = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": allowed
        }
    });

    if let Some(msg) = message {
        response["response"]["status"] = serde_json::json!({
            "message": msg
        });
    }

    response.to_string()
}

/* ============================= CERT GENERATION ============================= */

pub fn generate_certs(
    service_name: &str,
    namespace: &str,
    output_dir: &str,
    ip_sans: &[String],
) -> Result<()> {
    println!("Generating self-signed TLS certificates...\n");

    let (ca_pem, cert_pem, key_pem) = generate_self_signed_certs(service_name, namespace, ip_sans)?;

    let output_path = std::path::Path::new(output_dir);
    if !output_path.exists() {
        std::fs::create_dir_all(output_path).context("Failed to create output directory")?;
    }

    let ca_path = output_path.join("ca.crt");
    let cert_path = output_path.join("tls.crt");
    let key_path = output_path.join("tls.key");

    std::fs::write(&ca_path, &ca_pem).context("Failed to write ca.crt")?;
    std::fs::write(&cert_path, &cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &key_pem).context("Failed to write tls.key")?;

    println!("  CA certificate .............. {}", ca_path.display());
    println!("  Server certificate .......... {}", cert_path.display());
    println!("  Server key .................. {}", key_path.display());
    println!();
    println!("  Service name ................ {service_name}");
    println!("  Namespace ................... {namespace}");
    println!("  SANs:");
    println!("    - {service_name}.{namespace}.svc");
    println!("    - {service_name}.{namespace}.svc.cluster.local");
    for ip in ip_sans {
        println!("    - {ip} (IP)");
    }
    println!();
    println!("TLS certificates generated successfully.");

    Ok(())
}

pub fn generate_self_signed_certs(
    service_name: &str,
    namespace: &str,
    ip_sans: &[String],
) -> Result<(String, String, String)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use std::net::IpAddr;

    // Generate CA key pair and certificate
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "signalproc-webhook-ca");
    ca_dn.push(DnType::OrganizationName, "signalproc");
    ca_params.distinguished_name = ca_dn;

    let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context("Failed to self-sign CA certificate")?;

    // Generate server key pair and certificate signed by the CA
    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;

    let mut sans = vec![
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc.cluster.local")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
    ];

    for ip_str in ip_sans {
        let ip: IpAddr = ip_str
            .parse()
            .context(format!("Invalid IP address for SAN: {ip_str}"))?;
        sans.push(SanType::IpAddress(ip));
    }

    server_params.subject_alt_names = sans;

    let server_key = KeyPair::generate().context("Failed to generate server key pair")?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("Failed to sign server certificate")?;

    let ca_pem = ca_cert.pem();
    let cert_pem = server_cert.pem();
    let key_pem = server_key.serialize_pem();

    Ok((ca_pem, cert_pem, key_pem))
}

/* ============================= INSTALL CONFIG ============================= */

pub fn install_config(service_name: &str, namespace: &str, ca_bundle_path: &str) -> Result<()> {
    use base64::Engine;

    let ca_bytes = std::fs::read(ca_bundle_path).context("Failed to read CA bundle file")?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(&ca_bytes);

    let yaml = format!(
        r#"apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: {service_name}
webhooks:
  - name: validate.kubernaut.ai
    rules:
      - apiGroups: ["kubernaut.ai"]
        resources: ["signalprocessings"]
        apiVersions: ["v1"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate
      caBundle: {ca_b64}
    failurePolicy: Fail
    sideEffects: None
    admissionReviewVersions: ["v1"]
"#
    );

    println!("{yaml}");
    Ok(())
}

/* ============================= TESTS ============================= */
