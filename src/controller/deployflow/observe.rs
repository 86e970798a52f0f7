//! Observation of the substrate
//!
//! Snapshot of the CloneSet and its pods taken once at the start of a pass,
//! plus the pod predicates and batch membership rules shared by the
//! progression engine and the status reconciler.

use super::strategy::EffectiveStrategy;
use super::workload::{WorkloadClient, WorkloadError};
use crate::crd::cloneset::{CloneSet, REVISION_LABEL};
use crate::crd::deployflow::{BatchCondition, BatchPhase, DeployAction, DeployFlow, PodInfo};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Pod label an external traffic agent watches to admit traffic
pub const PULL_IN_LABEL: &str = "apps.triton.io/pull-in";

pub const PULLED_IN: &str = "PulledIn";
pub const PULLED_OUT: &str = "PulledOut";
pub const PULL_IN_NONE: &str = "None";

/// Container waiting reasons that mean the pod will not become ready on its own
const FAILED_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "CreateContainerConfigError",
    "CreateContainerError",
    "InvalidImageName",
];

/// What the pass saw of the substrate
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub workload: Option<CloneSet>,
    pub pods: Vec<Pod>,
}

impl Observation {
    /// Read the CloneSet named by the application and the pods it selects
    pub async fn capture(
        client: &dyn WorkloadClient,
        namespace: &str,
        flow: &DeployFlow,
    ) -> Result<Self, WorkloadError> {
        let name = &flow.spec.application.cloneset_name;
        let workload = client.get_workload(namespace, name).await?;

        let selector = workload
            .as_ref()
            .map(|cs| cs.spec.selector.clone())
            .or_else(|| flow.spec.application.selector.clone());

        let pods = match (&workload, selector) {
            (Some(_), Some(selector)) => client.list_pods(namespace, &selector).await?,
            _ => Vec::new(),
        };

        Ok(Observation { workload, pods })
    }

    /// Pods not being deleted
    pub fn live_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.iter().filter(|p| !is_terminating(p))
    }

    pub fn workload_replicas(&self) -> Option<i32> {
        self.workload.as_ref().map(|cs| cs.desired_replicas())
    }
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True")
}

/// When a not-ready pod last stopped (or never started) being ready
pub fn not_ready_since(pod: &Pod) -> Option<DateTime<Utc>> {
    if is_ready(pod) {
        return None;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0)
        .or_else(|| created_at(pod))
}

/// Failed phase, or a container stuck in a non-recoverable waiting state
pub fn has_failed(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() == Some("Failed") {
        return true;
    }
    status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .any(|reason| FAILED_WAITING_REASONS.contains(&reason))
}

pub fn created_at(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Whether `pod` was created at or after `since`
///
/// The apiserver stamps `creationTimestamp` with whole seconds. When the
/// timestamp carries a fraction both sides are compared exactly; otherwise
/// the comparison falls back to the second, counting a pod created in the
/// same second as the rollout start as new.
pub fn created_since(pod: &Pod, since: DateTime<Utc>) -> Option<bool> {
    let created = created_at(pod)?;
    if created.timestamp_subsec_nanos() != 0 {
        Some(created >= since)
    } else {
        Some(created.timestamp() >= since.timestamp())
    }
}

pub fn revision(pod: &Pod) -> Option<&str> {
    pod.labels().get(REVISION_LABEL).map(String::as_str)
}

pub fn pull_in_status(pod: &Pod) -> &'static str {
    match pod.labels().get(PULL_IN_LABEL).map(String::as_str) {
        Some("true") => PULLED_IN,
        Some("false") => PULLED_OUT,
        _ => PULL_IN_NONE,
    }
}

/// Summary of a pod for the status record
pub fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    let port = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.container_port)
        .unwrap_or(0);

    PodInfo {
        name: pod.name_any(),
        ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        port,
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        pull_in_status: pull_in_status(pod).to_string(),
    }
}

pub fn parse_time(ts: Option<&str>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Direction of a scale rollout relative to the replicas it started from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Out,
    In,
}

/// Scale direction from the target replica count and the recorded baseline
///
/// `scaleIn` and `scaleOut` name the intent; the replica counts decide.
pub fn scale_direction(flow: &DeployFlow, baseline: i32) -> ScaleDirection {
    match flow.spec.application.replicas {
        Some(target) if target < baseline => ScaleDirection::In,
        _ => ScaleDirection::Out,
    }
}

/// Pods belonging to the rollout, oldest first
///
/// Revision changes count pods at the CloneSet's update revision; every
/// other action counts pods created since the rollout started. Scale-in
/// rollouts remove pods and so have none.
pub fn rollout_pods<'a>(
    flow: &DeployFlow,
    started_at: Option<DateTime<Utc>>,
    baseline: Option<i32>,
    obs: &'a Observation,
) -> Vec<&'a Pod> {
    let action = flow.spec.action;
    if action.is_scale()
        && scale_direction(flow, baseline.unwrap_or(0)) == ScaleDirection::In
    {
        return Vec::new();
    }

    let update_revision = obs.workload.as_ref().and_then(|cs| cs.update_revision());

    let mut pods: Vec<&Pod> = obs
        .live_pods()
        .filter(|pod| {
            if action.revision_changed() {
                update_revision.is_some() && revision(pod) == update_revision
            } else if action == DeployAction::Create {
                true
            } else {
                started_at
                    .and_then(|since| created_since(pod, since))
                    .unwrap_or(false)
            }
        })
        .collect();

    pods.sort_by(|a, b| {
        created_at(a)
            .cmp(&created_at(b))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
    pods
}

/// Assign rollout pods to dispatched batches, in batch order
///
/// Batch `i` receives the next `batch_size` pods; pending batches get none.
pub fn assign_batches<'a>(conditions: &[BatchCondition], pods: &[&'a Pod]) -> Vec<Vec<&'a Pod>> {
    let mut cursor = 0usize;
    conditions
        .iter()
        .map(|c| {
            if c.phase == BatchPhase::Pending {
                return Vec::new();
            }
            let size = c.batch_size.max(0) as usize;
            let end = (cursor + size).min(pods.len());
            let assigned = pods[cursor.min(end)..end].to_vec();
            cursor = end;
            assigned
        })
        .collect()
}

/// Batch membership for a whole pass
pub fn batch_pods<'a>(
    flow: &DeployFlow,
    conditions: &[BatchCondition],
    started_at: Option<&str>,
    baseline: Option<i32>,
    obs: &'a Observation,
) -> Vec<Vec<&'a Pod>> {
    let pods = rollout_pods(flow, parse_time(started_at), baseline, obs);
    assign_batches(conditions, &pods)
}

/// Cumulative replicas of every dispatched batch
pub fn dispatched_replicas(conditions: &[BatchCondition]) -> i32 {
    conditions
        .iter()
        .filter(|c| c.phase != BatchPhase::Pending)
        .map(|c| c.batch_size)
        .sum()
}

/// Whether the effective strategy admits traffic through the pull-in label
pub fn uses_pull_in(eff: &EffectiveStrategy) -> bool {
    !eff.no_pull_in
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod(name: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_created_since_compares_fractions_when_present() {
        let start = DateTime::from_timestamp(1_775_000_100, 700_000_000).unwrap();
        let created = |secs: i64, nanos: u32| {
            let mut p = pod("a", true);
            p.metadata.creation_timestamp =
                Some(Time(DateTime::from_timestamp(secs, nanos).unwrap()));
            p
        };

        assert_eq!(created_since(&created(1_775_000_100, 500_000_000), start), Some(false));
        assert_eq!(created_since(&created(1_775_000_100, 900_000_000), start), Some(true));
        // Whole-second stamps cannot be ordered within the second
        assert_eq!(created_since(&created(1_775_000_100, 0), start), Some(true));
        assert_eq!(created_since(&created(1_775_000_099, 0), start), Some(false));
        assert_eq!(created_since(&pod("b", true), start), None);
    }

    #[test]
    fn test_readiness_from_condition() {
        assert!(is_ready(&pod("a", true)));
        assert!(!is_ready(&pod("a", false)));
        assert!(!is_ready(&Pod::default()));
    }

    #[test]
    fn test_crash_loop_counts_as_failed() {
        let mut p = pod("a", false);
        assert!(!has_failed(&p));

        if let Some(status) = p.status.as_mut() {
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
        assert!(has_failed(&p));
    }

    #[test]
    fn test_failed_phase_counts_as_failed() {
        let mut p = pod("a", false);
        if let Some(status) = p.status.as_mut() {
            status.phase = Some("Failed".to_string());
        }
        assert!(has_failed(&p));
    }

    #[test]
    fn test_pull_in_status_from_label() {
        let mut p = pod("a", true);
        assert_eq!(pull_in_status(&p), PULL_IN_NONE);
        p.labels_mut().insert(PULL_IN_LABEL.to_string(), "true".to_string());
        assert_eq!(pull_in_status(&p), PULLED_IN);
        p.labels_mut().insert(PULL_IN_LABEL.to_string(), "false".to_string());
        assert_eq!(pull_in_status(&p), PULLED_OUT);
    }

    #[test]
    fn test_not_ready_since_uses_transition_time() {
        let t = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut p = pod("a", false);
        if let Some(conds) = p.status.as_mut().and_then(|s| s.conditions.as_mut()) {
            conds[0].last_transition_time = Some(Time(t));
        }
        assert_eq!(not_ready_since(&p), Some(t));
        assert_eq!(not_ready_since(&pod("b", true)), None);
    }

    #[test]
    fn test_assign_batches_fills_dispatched_in_order() {
        let pods: Vec<Pod> = (0..5).map(|i| pod(&format!("p{i}"), true)).collect();
        let refs: Vec<&Pod> = pods.iter().collect();
        let conditions = vec![
            BatchCondition {
                batch: 1,
                batch_size: 2,
                phase: BatchPhase::Baked,
                ..Default::default()
            },
            BatchCondition {
                batch: 2,
                batch_size: 4,
                phase: BatchPhase::Smoking,
                ..Default::default()
            },
            BatchCondition {
                batch: 3,
                batch_size: 4,
                phase: BatchPhase::Pending,
                ..Default::default()
            },
        ];

        let assigned = assign_batches(&conditions, &refs);
        let names: Vec<Vec<String>> = assigned
            .iter()
            .map(|b| b.iter().map(|p| p.name_any()).collect())
            .collect();
        assert_eq!(names[0], vec!["p0", "p1"]);
        assert_eq!(names[1], vec!["p2", "p3", "p4"]);
        assert!(names[2].is_empty());
        assert_eq!(dispatched_replicas(&conditions), 6);
    }

    #[test]
    fn test_pod_info_summary() {
        let mut p = pod("web-0", true);
        if let Some(status) = p.status.as_mut() {
            status.pod_ip = Some("10.0.0.7".to_string());
        }
        let info = pod_info(&p);
        assert_eq!(info.name, "web-0");
        assert_eq!(info.ip, "10.0.0.7");
        assert_eq!(info.phase, "Running");
        assert_eq!(info.pull_in_status, PULL_IN_NONE);
    }
}
