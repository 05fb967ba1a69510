use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AuditConfig;

/* ============================= EVENT MODEL ============================= */

pub const EVENT_CATEGORY: &str = "signalprocessing";
pub const SERVICE_NAME: &str = "SignalProcessing";
pub const ACTOR_TYPE: &str = "service";
pub const ACTOR_ID: &str = "signalprocessing-controller";

pub const EVENT_SIGNAL_PROCESSED: &str = "signal.processed";
pub const EVENT_PHASE_TRANSITION: &str = "phase.transition";
pub const EVENT_CLASSIFICATION_DECISION: &str = "classification.decision";
pub const EVENT_BUSINESS_CLASSIFIED: &str = "business.classified";
pub const EVENT_ENRICHMENT_COMPLETED: &str = "enrichment.completed";
pub const EVENT_ERROR_OCCURRED: &str = "error.occurred";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    Success,
    Failure,
}

/// An immutable, correlation-tagged audit event. The correlation id is the
/// parent remediation record name; DataStorage deduplicates on `eventId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_category: String,
    pub event_action: String,
    pub event_outcome: EventOutcome,
    pub event_timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub service_name: String,
    pub actor_type: String,
    pub actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub event_data: Value,
}

/// Payload of a classification.decision event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationDecision {
    pub external_severity: String,
    pub normalized_severity: String,
    pub environment: String,
    pub priority: String,
    pub signal_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_signal_type: Option<String>,
    pub determination_source: String,
    pub policy_hash: String,
}

impl AuditEvent {
    fn base(
        event_type: &str,
        event_action: &str,
        event_outcome: EventOutcome,
        correlation_id: &str,
        event_data: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            event_category: EVENT_CATEGORY.to_string(),
            event_action: event_action.to_string(),
            event_outcome,
            event_timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            service_name: SERVICE_NAME.to_string(),
            actor_type: ACTOR_TYPE.to_string(),
            actor_id: ACTOR_ID.to_string(),
            duration_ms: None,
            event_data,
        }
    }

    pub fn phase_transition(
        correlation_id: &str,
        from: &str,
        to: &str,
        outcome: EventOutcome,
    ) -> Self {
        Self::base(
            EVENT_PHASE_TRANSITION,
            "transition",
            outcome,
            correlation_id,
            json!({ "from": from, "to": to }),
        )
    }

    pub fn signal_processed(correlation_id: &str, event_data: Value) -> Self {
        Self::base(
            EVENT_SIGNAL_PROCESSED,
            "processed",
            EventOutcome::Success,
            correlation_id,
            event_data,
        )
    }

    pub fn classification_decision(correlation_id: &str, decision: &ClassificationDecision) -> Self {
        Self::base(
            EVENT_CLASSIFICATION_DECISION,
            "classify",
            EventOutcome::Success,
            correlation_id,
            serde_json::to_value(decision).unwrap_or_default(),
        )
    }

    pub fn business_classified(correlation_id: &str, event_data: Value) -> Self {
        Self::base(
            EVENT_BUSINESS_CLASSIFIED,
            "categorize",
            EventOutcome::Success,
            correlation_id,
            event_data,
        )
    }

    pub fn enrichment_completed(
        correlation_id: &str,
        has_namespace: bool,
        has_pod: bool,
        degraded_mode: bool,
        duration_ms: u64,
    ) -> Self {
        let mut event = Self::base(
            EVENT_ENRICHMENT_COMPLETED,
            "enrich",
            EventOutcome::Success,
            correlation_id,
            json!({
                "has_namespace": has_namespace,
                "has_pod": has_pod,
                "degraded_mode": degraded_mode,
                "durationMs": duration_ms,
            }),
        );
        event.duration_ms = Some(duration_ms);
        event
    }

    pub fn error_occurred(correlation_id: &str, phase: &str, error: &str) -> Self {
        Self::base(
            EVENT_ERROR_OCCURRED,
            "error",
            EventOutcome::Failure,
            correlation_id,
            json!({ "phase": phase, "error": error }),
        )
    }
}

/* ============================= SINK ============================= */

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("datastorage write failed: {0}")]
    Write(String),

    #[error("audit flush deadline exceeded")]
    Timeout,
}

/// Batch writer for audit events. Must be idempotent on `eventId`.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), SinkError>;
}

/// DataStorage HTTP sink. Writes batches to the audit write API.
pub struct HttpAuditSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAuditSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), SinkError> {
        let url = format!(
            "{}/api/v1/audit/events",
            self.endpoint.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({ "events": events }))
            .send()
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| SinkError::Write(e.to_string()))?;
        Ok(())
    }
}

/* ============================= EMITTER ============================= */

#[derive(Debug, Clone)]
pub struct EmitterSettings {
    pub flush_interval: Duration,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub buffer_capacity: usize,
    pub shutdown_timeout: Duration,
}

impl Default for EmitterSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1000),
            max_attempts: 3,
            retry_base: Duration::from_millis(100),
            buffer_capacity: 4096,
            shutdown_timeout: Duration::from_millis(5000),
        }
    }
}

impl From<&AuditConfig> for EmitterSettings {
    fn from(config: &AuditConfig) -> Self {
        Self {
            flush_interval: Duration::from_millis(config.flush_interval_ms.clamp(100, 1000)),
            max_attempts: config.max_attempts.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
            buffer_capacity: config.buffer_capacity,
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        }
    }
}

const RETRY_CAP: Duration = Duration::from_secs(5);

/// Buffered audit event sink. The append path is a mutex push and never
/// waits on storage; a background task flushes batches to DataStorage.
/// Within a correlation id, events flush in append order.
pub struct AuditEmitter {
    buffer: Mutex<Vec<AuditEvent>>,
    sink: Arc<dyn AuditSink>,
    settings: EmitterSettings,
    dropped: AtomicU64,
    write_failures: AtomicU64,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>, settings: EmitterSettings) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            sink,
            settings,
            dropped: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, Vec<AuditEvent>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append one event. Overflow beyond capacity drops oldest-first.
    pub fn append(&self, event: AuditEvent) {
        let mut buffer = self.lock_buffer();
        if buffer.len() >= self.settings.buffer_capacity {
            buffer.remove(0);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("audit_buffer_overflow_dropping_oldest");
        }
        buffer.push(event);
    }

    pub fn buffer_depth(&self) -> usize {
        self.lock_buffer().len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn write_failures_total(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    fn take_buffer(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.lock_buffer())
    }

    fn requeue_front(&self, events: Vec<AuditEvent>) {
        let mut buffer = self.lock_buffer();
        let mut merged = events;
        merged.append(&mut buffer);
        *buffer = merged;
    }

    /// Force an immediate drain. Returns the number of events written, or an
    /// error once the deadline expires; unwritten events stay buffered in
    /// their original order.
    pub async fn flush(&self, deadline: Duration) -> Result<usize, SinkError> {
        let batch = self.take_buffer();
        if batch.is_empty() {
            return Ok(0);
        }
        match timeout(deadline, self.sink.write_batch(&batch)).await {
            Ok(Ok(())) => Ok(batch.len()),
            Ok(Err(e)) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                self.requeue_front(batch);
                Err(e)
            }
            Err(_) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                self.requeue_front(batch);
                Err(SinkError::Timeout)
            }
        }
    }

    async fn write_with_retry(&self, batch: Vec<AuditEvent>) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.write_batch(&batch).await {
                Ok(()) => return,
                Err(e) => {
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    if attempt >= self.settings.max_attempts {
                        self.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                        error!(
                            error = %e,
                            events = batch.len(),
                            attempts = attempt,
                            "audit_batch_dropped"
                        );
                        return;
                    }
                    let delay =
                        (self.settings.retry_base * 2u32.pow(attempt - 1)).min(RETRY_CAP);
                    warn!(
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "audit_write_failed_retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Run the background flush loop until shutdown, then drain once under
    /// the shutdown deadline. Residual events are reported as dropped.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let emitter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(emitter.settings.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        let batch = emitter.take_buffer();
                        if !batch.is_empty() {
                            let deadline = emitter.settings.shutdown_timeout;
                            match timeout(deadline, emitter.sink.write_batch(&batch)).await {
                                Ok(Ok(())) => {}
                                _ => {
                                    emitter
                                        .dropped
                                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                                    error!(
                                        residual = batch.len(),
                                        "audit_shutdown_events_dropped"
                                    );
                                }
                            }
                        }
                        info!("audit_flusher_stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let batch = emitter.take_buffer();
                        if !batch.is_empty() {
                            emitter.write_with_retry(batch).await;
                        }
                    }
                }
            }
        })
    }
}

/* ============================= TESTS ============================= */
