use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Container, Namespace, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::EnrichmentConfig;
use crate::crd::{ContainerResources, NamespaceInfo, OwnerLink, TargetResource, WorkloadInfo};

/* ============================= LIMITS ============================= */

/// Owner chain traversal stops at this depth; hitting the cap is not an error.
pub const OWNER_CHAIN_MAX_DEPTH: usize = 5;

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("kubernetes api unauthorized: {0}")]
    Unauthorized(String),

    #[error("transient kubernetes api failure: {0}")]
    Transient(String),
}

impl EnrichError {
    /// Fatal errors terminate the SP; transient ones feed the reconciler's
    /// own backoff.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EnrichError::Transient(_))
    }
}

/* ============================= OUTPUT ============================= */

/// Enrichment record for a signal's target resource.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Enrichment {
    pub namespace: NamespaceInfo,
    pub workload: Option<WorkloadInfo>,
    pub owner_chain: Vec<OwnerLink>,
    /// Set when the workload was missing or part of the owner chain was
    /// unreadable; the namespace itself is always present.
    pub degraded: bool,
}

/* ============================= SEAM ============================= */

/// Enrichment seam. The production implementation talks to the Kubernetes
/// API; tests substitute fakes.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    async fn enrich(&self, target: &TargetResource) -> Result<Enrichment, EnrichError>;
}

/* ============================= K8S ENRICHER ============================= */

pub struct K8sEnricher {
    client: Client,
    api_timeout: Duration,
    max_attempts: u32,
    retry_base: Duration,
}

impl K8sEnricher {
    pub fn new(client: Client, config: &EnrichmentConfig) -> Self {
        Self {
            client,
            api_timeout: Duration::from_millis(config.api_timeout_ms),
            max_attempts: config.max_attempts.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
        }
    }

    /// Fetch one object with the per-call deadline and transient retry.
    /// `Ok(None)` means the object does not exist.
    async fn get_opt<K>(&self, api: &Api<K>, name: &str, what: &str) -> Result<Option<K>, EnrichError>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = timeout(self.api_timeout, api.get(name)).await;
            let error_text = match outcome {
                Ok(Ok(object)) => return Ok(Some(object)),
                Ok(Err(kube::Error::Api(response))) if response.code == 404 => return Ok(None),
                Ok(Err(kube::Error::Api(response)))
                    if response.code == 401 || response.code == 403 =>
                {
                    return Err(EnrichError::Unauthorized(response.message));
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("{what} '{name}' timed out after {:?}", self.api_timeout),
            };

            if attempt >= self.max_attempts {
                return Err(EnrichError::Transient(format!(
                    "{what} '{name}': {error_text} ({attempt} attempts)"
                )));
            }

            let delay = self.retry_base * 2u32.pow(attempt - 1);
            debug!(what, name, attempt, error = %error_text, "enrich_retry");
            sleep(delay).await;
        }
    }

    async fn fetch_namespace(&self, name: &str) -> Result<NamespaceInfo, EnrichError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = self
            .get_opt(&api, name, "namespace")
            .await?
            .ok_or_else(|| EnrichError::NamespaceNotFound(name.to_string()))?;

        Ok(NamespaceInfo {
            name: name.to_string(),
            labels: namespace.metadata.labels.unwrap_or_default(),
            annotations: namespace.metadata.annotations.unwrap_or_default(),
        })
    }

    /// Fetch the target workload. `Ok(None)` marks the degraded path: the
    /// namespace exists but the workload does not, or the kind is one we
    /// cannot read.
    async fn fetch_workload(
        &self,
        target: &TargetResource,
    ) -> Result<Option<(ObjectMeta, Vec<ContainerResources>)>, EnrichError> {
        let ns = &target.namespace;
        let name = &target.name;
        match target.kind.as_str() {
            "Pod" => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
                Ok(self.get_opt(&api, name, "pod").await?.map(|p| {
                    let containers = p
                        .spec
                        .as_ref()
                        .map(|s| containers_of(&s.containers))
                        .unwrap_or_default();
                    (p.metadata, containers)
                }))
            }
            "Deployment" => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
                Ok(self.get_opt(&api, name, "deployment").await?.map(|d| {
                    let containers = d
                        .spec
                        .as_ref()
                        .and_then(|s| s.template.spec.as_ref())
                        .map(pod_spec_containers)
                        .unwrap_or_default();
                    (d.metadata, containers)
                }))
            }
            "ReplicaSet" => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), ns);
                Ok(self.get_opt(&api, name, "replicaset").await?.map(|r| {
                    let containers = r
                        .spec
                        .as_ref()
                        .and_then(|s| s.template.as_ref())
                        .and_then(|t| t.spec.as_ref())
                        .map(pod_spec_containers)
                        .unwrap_or_default();
                    (r.metadata, containers)
                }))
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), ns);
                Ok(self.get_opt(&api, name, "statefulset").await?.map(|s| {
                    let containers = s
                        .spec
                        .as_ref()
                        .and_then(|spec| spec.template.spec.as_ref())
                        .map(pod_spec_containers)
                        .unwrap_or_default();
                    (s.metadata, containers)
                }))
            }
            "DaemonSet" => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), ns);
                Ok(self.get_opt(&api, name, "daemonset").await?.map(|d| {
                    let containers = d
                        .spec
                        .as_ref()
                        .and_then(|s| s.template.spec.as_ref())
                        .map(pod_spec_containers)
                        .unwrap_or_default();
                    (d.metadata, containers)
                }))
            }
            "Job" => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), ns);
                Ok(self.get_opt(&api, name, "job").await?.map(|j| {
                    let containers = j
                        .spec
                        .as_ref()
                        .and_then(|s| s.template.spec.as_ref())
                        .map(pod_spec_containers)
                        .unwrap_or_default();
                    (j.metadata, containers)
                }))
            }
            "CronJob" => {
                let api: Api<CronJob> = Api::namespaced(self.client.clone(), ns);
                Ok(self.get_opt(&api, name, "cronjob").await?.map(|c| {
                    let containers = c
                        .spec
                        .as_ref()
                        .and_then(|s| s.job_template.spec.as_ref())
                        .and_then(|j| j.template.spec.as_ref())
                        .map(pod_spec_containers)
                        .unwrap_or_default();
                    (c.metadata, containers)
                }))
            }
            other => {
                warn!(kind = other, "enrich_unsupported_target_kind");
                Ok(None)
            }
        }
    }

    /// Fetch an owner's metadata by kind. `Ok(None)` covers both a missing
    /// object and a kind we cannot read; the traversal degrades either way.
    async fn fetch_owner_meta(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<ObjectMeta>, EnrichError> {
        match kind {
            "Pod" => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                Ok(self.get_opt(&api, name, "pod").await?.map(|o| o.metadata))
            }
            "ReplicaSet" => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
                Ok(self.get_opt(&api, name, "replicaset").await?.map(|o| o.metadata))
            }
            "Deployment" => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                Ok(self.get_opt(&api, name, "deployment").await?.map(|o| o.metadata))
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                Ok(self.get_opt(&api, name, "statefulset").await?.map(|o| o.metadata))
            }
            "DaemonSet" => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                Ok(self.get_opt(&api, name, "daemonset").await?.map(|o| o.metadata))
            }
            "Job" => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                Ok(self.get_opt(&api, name, "job").await?.map(|o| o.metadata))
            }
            "CronJob" => {
                let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
                Ok(self.get_opt(&api, name, "cronjob").await?.map(|o| o.metadata))
            }
            _ => Ok(None),
        }
    }

    /// Follow controller references outward from the target, nearest-to-root.
    ///
    /// Stops at: no controller reference, depth cap, an unreadable owner
    /// (degrades, keeping the chain so far), or a repeated UID.
    async fn build_owner_chain(
        &self,
        namespace: &str,
        start: &ObjectMeta,
    ) -> (Vec<OwnerLink>, bool) {
        let mut chain = Vec::new();
        let mut degraded = false;
        let mut seen: HashSet<String> = HashSet::new();
        if let Some(uid) = &start.uid {
            seen.insert(uid.clone());
        }

        let mut current = start.clone();
        while chain.len() < OWNER_CHAIN_MAX_DEPTH {
            let Some(owner) = next_controller_ref(&current) else {
                break;
            };

            if seen.contains(&owner.uid) {
                warn!(uid = %owner.uid, "owner_chain_cycle_detected");
                break;
            }

            chain.push(OwnerLink {
                kind: owner.kind.clone(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
            });
            seen.insert(owner.uid.clone());

            match self
                .fetch_owner_meta(namespace, &owner.kind, &owner.name)
                .await
            {
                Ok(Some(meta)) => current = meta,
                // Unreadable owner: the step stays in the chain, traversal
                // stops, enrichment degrades.
                Ok(None) => {
                    degraded = true;
                    break;
                }
                Err(e) => {
                    warn!(owner = %owner.name, error = %e, "owner_chain_fetch_failed");
                    degraded = true;
                    break;
                }
            }
        }

        (chain, degraded)
    }
}

#[async_trait]
impl EnrichmentSource for K8sEnricher {
    async fn enrich(&self, target: &TargetResource) -> Result<Enrichment, EnrichError> {
        let namespace = self.fetch_namespace(&target.namespace).await?;

        let mut degraded = false;
        let mut workload = None;
        let mut owner_chain = Vec::new();

        match self.fetch_workload(target).await? {
            Some((meta, containers)) => {
                let (chain, chain_degraded) =
                    self.build_owner_chain(&target.namespace, &meta).await;
                owner_chain = chain;
                degraded |= chain_degraded;
                workload = Some(WorkloadInfo {
                    kind: target.kind.clone(),
                    name: target.name.clone(),
                    labels: meta.labels.unwrap_or_default(),
                    annotations: meta.annotations.unwrap_or_default(),
                    containers,
                });
            }
            None => {
                debug!(
                    kind = %target.kind,
                    name = %target.name,
                    namespace = %target.namespace,
                    "enrich_target_missing_degraded"
                );
                degraded = true;
            }
        }

        Ok(Enrichment {
            namespace,
            workload,
            owner_chain,
            degraded,
        })
    }
}

/* ============================= CONTAINER EXTRACTION ============================= */

fn pod_spec_containers(spec: &PodSpec) -> Vec<ContainerResources> {
    containers_of(&spec.containers)
}

fn containers_of(containers: &[Container]) -> Vec<ContainerResources> {
    containers
        .iter()
        .map(|c| {
            let quantity = |map: &Option<BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>,
                            key: &str| {
                map.as_ref().and_then(|m| m.get(key)).map(|q| q.0.clone())
            };
            let resources = c.resources.as_ref();
            ContainerResources {
                name: c.name.clone(),
                cpu_request: resources.and_then(|r| quantity(&r.requests, "cpu")),
                cpu_limit: resources.and_then(|r| quantity(&r.limits, "cpu")),
                memory_request: resources.and_then(|r| quantity(&r.requests, "memory")),
                memory_limit: resources.and_then(|r| quantity(&r.limits, "memory")),
            }
        })
        .collect()
}

/// First owner reference with `controller=true`.
fn next_controller_ref(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/* ============================= TESTS ============================= */
