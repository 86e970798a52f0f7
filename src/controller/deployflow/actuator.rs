//! Pod/workload actuator
//!
//! Turns the decided status into changes on the CloneSet and its pods.
//! [`plan_actuations`] is pure and idempotent: it compares the decision with
//! what was observed and emits only the writes still missing. [`apply`]
//! performs them through the [`WorkloadClient`].

use super::observe::{
    self, batch_pods, created_at, created_since, is_ready, parse_time, pull_in_status,
    scale_direction, Observation, ScaleDirection, PULLED_IN,
};
use super::strategy::EffectiveStrategy;
use super::workload::{WorkloadClient, WorkloadError};
use crate::crd::cloneset::{CloneSet, CloneSetSpec};
use crate::crd::deployflow::{BatchPhase, DeployAction, DeployFlow, DeployFlowStatus};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// CloneSet annotation naming the DeployFlow driving it
pub const DEPLOYFLOW_ANNOTATION: &str = "apps.triton.io/deployflow";

/// A single write against the substrate
#[derive(Debug, Clone, PartialEq)]
pub enum Actuation {
    CreateWorkload(Box<CloneSet>),
    /// JSON merge patch of the CloneSet
    PatchWorkload(Value),
    PullIn(String),
    PullOut(String),
}

impl Actuation {
    pub fn kind(&self) -> &'static str {
        match self {
            Actuation::CreateWorkload(_) => "create",
            Actuation::PatchWorkload(_) => "patch",
            Actuation::PullIn(_) => "pull_in",
            Actuation::PullOut(_) => "pull_out",
        }
    }
}

/// Writes needed to bring the substrate in line with `status`
pub fn plan_actuations(
    flow: &DeployFlow,
    eff: &EffectiveStrategy,
    status: &DeployFlowStatus,
    obs: &Observation,
) -> Vec<Actuation> {
    if eff.paused
        || eff.canceled
        || status.finished
        || status.phase.is_terminal()
        || status.started_at.is_none()
    {
        return Vec::new();
    }

    let dispatched = observe::dispatched_replicas(&status.conditions);

    let Some(workload) = obs.workload.as_ref() else {
        if flow.spec.action == DeployAction::Create {
            return vec![Actuation::CreateWorkload(Box::new(build_workload(
                flow, dispatched,
            )))];
        }
        return Vec::new();
    };

    let flow_name = flow.name_any();
    let claimed = workload
        .annotations()
        .get(DEPLOYFLOW_ANNOTATION)
        .is_some_and(|owner| *owner == flow_name);

    let mut spec = Map::new();
    let total = status.replicas_to_process;

    match flow.spec.action {
        DeployAction::Create => {
            if workload.desired_replicas() != dispatched {
                spec.insert("replicas".into(), json!(dispatched));
            }
        }
        DeployAction::Update | DeployAction::Rollback => {
            let partition = total - dispatched;
            if !claimed {
                if let Ok(template) = serde_json::to_value(&flow.spec.application.template) {
                    spec.insert("template".into(), template);
                }
                spec.insert("replicas".into(), json!(total));
                spec.insert("updateStrategy".into(), json!({ "partition": partition }));
            } else if workload.partition() != Some(partition) {
                spec.insert("updateStrategy".into(), json!({ "partition": partition }));
            }
        }
        DeployAction::Scale | DeployAction::ScaleIn | DeployAction::ScaleOut => {
            let baseline = status
                .baseline_replicas
                .unwrap_or_else(|| workload.desired_replicas());
            match scale_direction(flow, baseline) {
                ScaleDirection::Out => {
                    let desired = baseline + dispatched;
                    if workload.desired_replicas() != desired {
                        spec.insert("replicas".into(), json!(desired));
                    }
                }
                ScaleDirection::In => {
                    let desired = baseline - dispatched;
                    let excess = workload.desired_replicas() - desired;
                    if excess > 0 {
                        let live: Vec<&Pod> = obs.live_pods().collect();
                        let victims = pick_victims(&live, &eff.pods_to_delete, excess as usize);
                        spec.insert("replicas".into(), json!(desired));
                        if !victims.is_empty() {
                            let marked = merge_pods_to_delete(workload, obs, victims);
                            spec.insert("scaleStrategy".into(), json!({ "podsToDelete": marked }));
                        }
                    }
                }
            }
        }
        DeployAction::Restart => {
            let started = parse_time(status.started_at.as_deref());
            let restarted = observe::rollout_pods(flow, started, None, obs).len() as i32;
            // Marked pods count until they are gone, terminating or not
            let in_flight = pending_deletions(workload, obs).len() as i32;
            let deficit = dispatched - restarted - in_flight;
            if deficit > 0 {
                let marked: BTreeSet<&str> =
                    workload.pods_to_delete().iter().map(String::as_str).collect();
                let old: Vec<&Pod> = obs
                    .live_pods()
                    .filter(|p| !marked.contains(p.name_any().as_str()))
                    .filter(|p| {
                        !started
                            .and_then(|since| created_since(p, since))
                            .unwrap_or(false)
                    })
                    .collect();
                let victims = pick_victims(&old, &eff.pods_to_delete, deficit as usize);
                if !victims.is_empty() {
                    let marked = merge_pods_to_delete(workload, obs, victims);
                    spec.insert("scaleStrategy".into(), json!({ "podsToDelete": marked }));
                }
            }
        }
    }

    let mut actuations = Vec::new();
    if !spec.is_empty() || !claimed {
        let mut patch = Map::new();
        if !claimed {
            patch.insert(
                "metadata".into(),
                json!({ "annotations": { DEPLOYFLOW_ANNOTATION: flow_name } }),
            );
        }
        if !spec.is_empty() {
            patch.insert("spec".into(), Value::Object(spec));
        }
        actuations.push(Actuation::PatchWorkload(Value::Object(patch)));
    }

    actuations.extend(traffic_actuations(flow, eff, status, obs));
    actuations
}

/// Pull-in for healthy baking pods, pull-out for sick ones
fn traffic_actuations(
    flow: &DeployFlow,
    eff: &EffectiveStrategy,
    status: &DeployFlowStatus,
    obs: &Observation,
) -> Vec<Actuation> {
    if !observe::uses_pull_in(eff) {
        return Vec::new();
    }

    let assigned = batch_pods(
        flow,
        &status.conditions,
        status.started_at.as_deref(),
        status.baseline_replicas,
        obs,
    );

    let mut actuations = Vec::new();
    for (cond, pods) in status.conditions.iter().zip(&assigned) {
        match cond.phase {
            BatchPhase::Baking | BatchPhase::Baked => {
                for pod in pods {
                    if is_ready(pod) && pull_in_status(pod) != PULLED_IN {
                        actuations.push(Actuation::PullIn(pod.name_any()));
                    }
                }
            }
            BatchPhase::BakeFailed => {
                for pod in pods {
                    if !is_ready(pod) && pull_in_status(pod) == PULLED_IN {
                        actuations.push(Actuation::PullOut(pod.name_any()));
                    }
                }
            }
            _ => {}
        }
    }
    actuations
}

/// Choose `count` pods to remove
///
/// An explicit list is honoured in order. Otherwise not-ready pods go
/// first, then the oldest.
fn pick_victims(candidates: &[&Pod], explicit: &[String], count: usize) -> Vec<String> {
    if !explicit.is_empty() {
        let available: BTreeSet<String> = candidates.iter().map(|p| p.name_any()).collect();
        return explicit
            .iter()
            .filter(|name| available.contains(*name))
            .take(count)
            .cloned()
            .collect();
    }

    let mut ordered: Vec<&Pod> = candidates.to_vec();
    ordered.sort_by(|a, b| {
        is_ready(a)
            .cmp(&is_ready(b))
            .then_with(|| created_at(a).cmp(&created_at(b)))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
    ordered
        .into_iter()
        .take(count)
        .map(|p| p.name_any())
        .collect()
}

/// Marked pods the apiserver still reports, including terminating ones
fn pending_deletions(workload: &CloneSet, obs: &Observation) -> Vec<String> {
    let present: BTreeSet<String> = obs.pods.iter().map(|p| p.name_any()).collect();
    workload
        .pods_to_delete()
        .iter()
        .filter(|name| present.contains(*name))
        .cloned()
        .collect()
}

/// Still-pending deletions plus the new victims
fn merge_pods_to_delete(workload: &CloneSet, obs: &Observation, victims: Vec<String>) -> Vec<String> {
    let mut marked = pending_deletions(workload, obs);
    for victim in victims {
        if !marked.contains(&victim) {
            marked.push(victim);
        }
    }
    marked
}

/// CloneSet for a `create` rollout
pub fn build_workload(flow: &DeployFlow, replicas: i32) -> CloneSet {
    let app = &flow.spec.application;
    let selector = app.selector.clone().unwrap_or_else(|| LabelSelector {
        match_labels: app
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone()),
        ..Default::default()
    });

    CloneSet {
        metadata: ObjectMeta {
            name: Some(app.cloneset_name.clone()),
            namespace: flow.namespace(),
            labels: app.application_label.clone(),
            annotations: Some(
                [(DEPLOYFLOW_ANNOTATION.to_string(), flow.name_any())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: CloneSetSpec {
            replicas: Some(replicas),
            selector,
            template: app.template.clone(),
            volume_claim_templates: app.volume_claim_templates.clone(),
            ..Default::default()
        },
        status: None,
    }
}

/// Perform the actuations, stopping at the first failure
pub async fn apply(
    client: &dyn WorkloadClient,
    namespace: &str,
    flow: &DeployFlow,
    actuations: &[Actuation],
) -> Result<(), WorkloadError> {
    let cloneset = &flow.spec.application.cloneset_name;
    for actuation in actuations {
        match actuation {
            Actuation::CreateWorkload(workload) => {
                info!(cloneset = %cloneset, "Creating CloneSet");
                client.create_workload(namespace, workload).await?;
            }
            Actuation::PatchWorkload(patch) => {
                info!(cloneset = %cloneset, patch = %patch, "Steering CloneSet");
                client.patch_workload(namespace, cloneset, patch).await?;
            }
            Actuation::PullIn(pod) => {
                debug!(pod = %pod, "Pulling in pod");
                client.set_pull_in(namespace, pod, true).await?;
            }
            Actuation::PullOut(pod) => {
                debug!(pod = %pod, "Pulling out pod");
                client.set_pull_in(namespace, pod, false).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "actuator_test.rs"]
mod tests;
