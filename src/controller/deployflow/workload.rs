//! Workload client seam
//!
//! Everything the controller reads from or writes to the CloneSet and its
//! pods goes through [`WorkloadClient`]. Production uses
//! [`KubeWorkloadClient`]; tests use `MockWorkloadClient`, which keeps the
//! objects in memory and can play the CloneSet controller's part.

use super::observe::PULL_IN_LABEL;
use crate::crd::cloneset::CloneSet;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("CloneSet {0} not found")]
    NotFound(String),

    #[error("CloneSet {0} already exists")]
    AlreadyExists(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl WorkloadError {
    /// Optimistic concurrency rejection from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, WorkloadError::Kube(kube::Error::Api(e)) if e.code == 409)
    }
}

/// Read and steer the CloneSet behind a DeployFlow
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// `Ok(None)` when the CloneSet does not exist
    async fn get_workload(&self, namespace: &str, name: &str)
        -> Result<Option<CloneSet>, WorkloadError>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, WorkloadError>;

    async fn create_workload(
        &self,
        namespace: &str,
        workload: &CloneSet,
    ) -> Result<CloneSet, WorkloadError>;

    /// JSON merge patch of the CloneSet
    async fn patch_workload(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<CloneSet, WorkloadError>;

    /// Set the pull-in label; `true` admits traffic, `false` withdraws it
    async fn set_pull_in(&self, namespace: &str, pod: &str, pulled_in: bool)
        -> Result<(), WorkloadError>;
}

/// Render a label selector as a Kubernetes label query
pub fn selector_query(selector: &LabelSelector) -> String {
    let mut terms: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.as_deref().unwrap_or_default().join(",");
        let term = match expr.operator.as_str() {
            "In" => format!("{} in ({values})", expr.key),
            "NotIn" => format!("{} notin ({values})", expr.key),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            _ => continue,
        };
        terms.push(term);
    }

    terms.join(",")
}

/// Production client backed by the Kubernetes API
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CloneSet>, WorkloadError> {
        let api: Api<CloneSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, WorkloadError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let query = selector_query(selector);
        let params = ListParams::default().labels(&query);
        Ok(api.list(&params).await?.items)
    }

    async fn create_workload(
        &self,
        namespace: &str,
        workload: &CloneSet,
    ) -> Result<CloneSet, WorkloadError> {
        let api: Api<CloneSet> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), workload).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(WorkloadError::AlreadyExists(
                workload.metadata.name.clone().unwrap_or_default(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_workload(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<CloneSet, WorkloadError> {
        let api: Api<CloneSet> = Api::namespaced(self.client.clone(), namespace);
        debug!(cloneset = name, patch = %patch, "Patching CloneSet");
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
        {
            Ok(cs) => Ok(cs),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(WorkloadError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_pull_in(
        &self,
        namespace: &str,
        pod: &str,
        pulled_in: bool,
    ) -> Result<(), WorkloadError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "labels": { PULL_IN_LABEL: pulled_in.to_string() } }
        });
        match api
            .patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            // Pod went away between observation and actuation
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// JSON merge patch (RFC 7386)
#[cfg(test)]
pub fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_json(
                            target_map.entry(key.clone()).or_insert(Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Call recorded by the mock, in order
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadCall {
    Create(String),
    Patch(String, serde_json::Value),
    PullIn(String, bool),
}

#[cfg(test)]
#[derive(Default)]
struct MockState {
    workloads: std::collections::BTreeMap<String, CloneSet>,
    pods: Vec<Pod>,
    calls: Vec<WorkloadCall>,
    counter: u32,
    unhealthy_new_pods: bool,
}

/// In-memory CloneSet and pods
///
/// `settle` plays the CloneSet controller: it honours `podsToDelete`,
/// scales to `replicas` and updates pods to the update revision until only
/// `partition` pods remain on the old one.
#[cfg(test)]
#[derive(Default)]
pub struct MockWorkloadClient {
    state: std::sync::Mutex<MockState>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockWorkloadClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a CloneSet and `ready` pods at `current_revision`
    pub fn seed(
        &self,
        workload: CloneSet,
        current_revision: &str,
        created: chrono::DateTime<chrono::Utc>,
    ) {
        let name = workload.metadata.name.clone().unwrap_or_default();
        let replicas = workload.desired_replicas();
        let mut state = self.state.lock().unwrap();
        for _ in 0..replicas {
            state.counter += 1;
            let pod = mock_pod(&workload, state.counter, current_revision, created, true);
            state.pods.push(pod);
        }
        state.workloads.insert(name, workload);
    }

    /// New pods come up crash-looping instead of ready
    pub fn set_unhealthy_new_pods(&self, unhealthy: bool) {
        self.state.lock().unwrap().unhealthy_new_pods = unhealthy;
    }

    /// Flip readiness of a pod, stamping the transition time
    pub fn set_pod_ready(&self, pod: &str, ready: bool, at: chrono::DateTime<chrono::Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state
            .pods
            .iter_mut()
            .find(|p| p.metadata.name.as_deref() == Some(pod))
        {
            set_ready(p, ready, at);
        }
    }

    pub fn workload(&self, name: &str) -> Option<CloneSet> {
        self.state.lock().unwrap().workloads.get(name).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.state.lock().unwrap().pods.clone()
    }

    pub fn calls(&self) -> Vec<WorkloadCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Converge pods towards the CloneSet spec
    pub fn settle(&self, name: &str, now: chrono::DateTime<chrono::Utc>) {
        use crate::crd::cloneset::{CloneSetStatus, REVISION_LABEL};

        let mut state = self.state.lock().unwrap();
        let Some(mut workload) = state.workloads.get(name).cloned() else {
            return;
        };
        let update_revision = workload
            .update_revision()
            .map(str::to_string)
            .unwrap_or_else(|| "rev-1".to_string());
        let unhealthy = state.unhealthy_new_pods;
        let revision_of = |p: &Pod| {
            p.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(REVISION_LABEL))
                .cloned()
                .unwrap_or_default()
        };

        // Explicit deletions are recreated unless replicas shrink below them
        let victims: Vec<String> = workload.pods_to_delete().to_vec();
        state
            .pods
            .retain(|p| !victims.contains(p.metadata.name.as_ref().unwrap()));
        if let Some(strategy) = workload.spec.scale_strategy.as_mut() {
            strategy.pods_to_delete = None;
        }

        let replicas = workload.desired_replicas().max(0) as usize;
        while state.pods.len() > replicas {
            state.pods.pop();
        }
        while state.pods.len() < replicas {
            state.counter += 1;
            let revision = if victims.is_empty() {
                update_revision.clone()
            } else {
                // Recreated pods keep the revision they were deleted at
                workload
                    .status
                    .as_ref()
                    .and_then(|s| s.current_revision.clone())
                    .unwrap_or_else(|| update_revision.clone())
            };
            let pod = mock_pod(&workload, state.counter, &revision, now, !unhealthy);
            state.pods.push(pod);
        }

        let partition = workload.partition().unwrap_or(0).max(0) as usize;
        let target_updated = replicas.saturating_sub(partition);
        loop {
            let updated = state
                .pods
                .iter()
                .filter(|p| revision_of(p) == update_revision)
                .count();
            if updated >= target_updated {
                break;
            }
            let Some(idx) = state
                .pods
                .iter()
                .position(|p| revision_of(p) != update_revision)
            else {
                break;
            };
            state.pods.remove(idx);
            state.counter += 1;
            let pod = mock_pod(&workload, state.counter, &update_revision, now, !unhealthy);
            state.pods.push(pod);
        }

        let ready = state
            .pods
            .iter()
            .filter(|p| super::observe::is_ready(p))
            .count() as i32;
        let updated: Vec<&Pod> = state
            .pods
            .iter()
            .filter(|p| revision_of(p) == update_revision)
            .collect();
        let previous = workload.status.take().unwrap_or_default();
        workload.status = Some(CloneSetStatus {
            replicas: state.pods.len() as i32,
            ready_replicas: ready,
            available_replicas: ready,
            updated_replicas: updated.len() as i32,
            updated_ready_replicas: updated
                .iter()
                .filter(|p| super::observe::is_ready(p))
                .count() as i32,
            update_revision: Some(update_revision.clone()),
            ..previous
        });
        state.workloads.insert(name.to_string(), workload);
    }
}

#[cfg(test)]
fn set_ready(pod: &mut Pod, ready: bool, at: chrono::DateTime<chrono::Utc>) {
    use k8s_openapi::api::core::v1::PodCondition;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    let status = pod.status.get_or_insert_with(Default::default);
    status.conditions = Some(vec![PodCondition {
        type_: "Ready".to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        last_transition_time: Some(Time(at)),
        ..Default::default()
    }]);
}

#[cfg(test)]
fn mock_pod(
    workload: &CloneSet,
    id: u32,
    revision: &str,
    created: chrono::DateTime<chrono::Utc>,
    healthy: bool,
) -> Pod {
    use crate::crd::cloneset::REVISION_LABEL;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    let base = workload.metadata.name.clone().unwrap_or_default();
    let mut labels = workload.spec.selector.match_labels.clone().unwrap_or_default();
    labels.insert(REVISION_LABEL.to_string(), revision.to_string());

    let mut pod = Pod {
        metadata: ObjectMeta {
            name: Some(format!("{base}-{id:03}")),
            namespace: workload.metadata.namespace.clone(),
            labels: Some(labels),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(format!("10.0.0.{id}")),
            ..Default::default()
        }),
        ..Default::default()
    };
    set_ready(&mut pod, healthy, created);
    if !healthy {
        if let Some(status) = pod.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: "app".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("CrashLoopBackOff".to_string()),
                        message: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }
    }
    pod
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl WorkloadClient for MockWorkloadClient {
    async fn get_workload(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<CloneSet>, WorkloadError> {
        Ok(self.workload(name))
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        _selector: &LabelSelector,
    ) -> Result<Vec<Pod>, WorkloadError> {
        Ok(self.pods())
    }

    async fn create_workload(
        &self,
        _namespace: &str,
        workload: &CloneSet,
    ) -> Result<CloneSet, WorkloadError> {
        let name = workload.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if state.workloads.contains_key(&name) {
            return Err(WorkloadError::AlreadyExists(name));
        }
        state.calls.push(WorkloadCall::Create(name.clone()));
        state.workloads.insert(name, workload.clone());
        Ok(workload.clone())
    }

    async fn patch_workload(
        &self,
        _namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<CloneSet, WorkloadError> {
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.workloads.get(name) else {
            return Err(WorkloadError::NotFound(name.to_string()));
        };
        let mut value = serde_json::to_value(current)
            .map_err(|e| WorkloadError::Serialization(e.to_string()))?;
        merge_json(&mut value, patch);
        let patched: CloneSet = serde_json::from_value(value)
            .map_err(|e| WorkloadError::Serialization(e.to_string()))?;
        state
            .calls
            .push(WorkloadCall::Patch(name.to_string(), patch.clone()));
        state.workloads.insert(name.to_string(), patched.clone());
        Ok(patched)
    }

    async fn set_pull_in(
        &self,
        _namespace: &str,
        pod: &str,
        pulled_in: bool,
    ) -> Result<(), WorkloadError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(WorkloadCall::PullIn(pod.to_string(), pulled_in));
        if let Some(p) = state
            .pods
            .iter_mut()
            .find(|p| p.metadata.name.as_deref() == Some(pod))
        {
            p.metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(PULL_IN_LABEL.to_string(), pulled_in.to_string());
        }
        Ok(())
    }
}
