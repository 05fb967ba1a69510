use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{Api, Client};
use thiserror::Error;
use tracing::debug;

use crate::crd::{RecoveryContext, RemediationRequest, RemediationRequestRef};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("failed to read remediation request: {0}")]
    Api(String),
}

/* ============================= SEAM ============================= */

/// Resolves retry history from the parent remediation record. A missing
/// parent is never fatal; the SP proceeds without recovery context.
#[async_trait]
pub trait RecoveryLookup: Send + Sync {
    async fn recovery_context(
        &self,
        parent: &RemediationRequestRef,
    ) -> Result<Option<RecoveryContext>, RecoveryError>;
}

/* ============================= K8S RESOLVER ============================= */

pub struct K8sRecoveryResolver {
    client: Client,
}

impl K8sRecoveryResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RecoveryLookup for K8sRecoveryResolver {
    async fn recovery_context(
        &self,
        parent: &RemediationRequestRef,
    ) -> Result<Option<RecoveryContext>, RecoveryError> {
        let api: Api<RemediationRequest> =
            Api::namespaced(self.client.clone(), &parent.namespace);

        let record = match api.get(&parent.name).await {
            Ok(record) => record,
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(parent = %parent.name, "remediation_request_not_found");
                return Ok(None);
            }
            Err(e) => return Err(RecoveryError::Api(e.to_string())),
        };

        Ok(record.status.as_ref().and_then(context_from_status))
    }
}

/// Build recovery context from a parent's status; `None` when the parent has
/// not recorded any recovery attempt.
pub fn context_from_status(
    status: &crate::crd::RemediationRequestStatus,
) -> Option<RecoveryContext> {
    if status.recovery_attempts <= 0 {
        return None;
    }

    Some(RecoveryContext {
        attempt_count: status.recovery_attempts,
        previous_remediation_id: status.previous_remediation_id.clone(),
        last_failure_reason: status.last_failure_reason.clone(),
        time_since_first_failure: status
            .first_failure_time
            .as_deref()
            .and_then(time_since),
    })
}

fn time_since(rfc3339: &str) -> Option<String> {
    let first = DateTime::parse_from_rfc3339(rfc3339).ok()?;
    let elapsed = Utc::now().signed_duration_since(first.with_timezone(&Utc));
    Some(format!("{}s", elapsed.num_seconds().max(0)))
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RemediationRequestStatus;

    #[test]
    fn test_zero_attempts_yields_none() {
        let status = RemediationRequestStatus {
            recovery_attempts: 0,
            ..Default::default()
        };
        assert!(context_from_status(&status).is_none());
    }

    #[test]
    fn test_attempts_populate_context() {
        let status = RemediationRequestStatus {
            recovery_attempts: 3,
            previous_remediation_id: Some("rem-42".to_string()),
            last_failure_reason: Some("workflow timeout".to_string()),
            first_failure_time: None,
        };
        let context = context_from_status(&status).unwrap();
        assert_eq!(context.attempt_count, 3);
        assert_eq!(context.previous_remediation_id.as_deref(), Some("rem-42"));
        assert_eq!(
            context.last_failure_reason.as_deref(),
            Some("workflow timeout")
        );
        assert!(context.time_since_first_failure.is_none());
    }

    #[test]
    fn test_time_since_first_failure_formatted() {
        let an_hour_ago = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let status = RemediationRequestStatus {
            recovery_attempts: 1,
            first_failure_time: Some(an_hour_ago),
            ..Default::default()
        };
        let context = context_from_status(&status).unwrap();
        let formatted = context.time_since_first_failure.unwrap();
        assert!(formatted.ends_with('s'));
        let seconds: i64 = formatted.trim_end_matches('s').parse().unwrap();
        assert!((3590..=3610).contains(&seconds));
    }

    #[test]
    fn test_unparseable_first_failure_time_skipped() {
        let status = RemediationRequestStatus {
            recovery_attempts: 1,
            first_failure_time: Some("yesterday".to_string()),
            ..Default::default()
        };
        let context = context_from_status(&status).unwrap();
        assert!(context.time_since_first_failure.is_none());
    }
}
