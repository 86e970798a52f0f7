//! Status reconciler
//!
//! Rebuilds the observed parts of the status (pod summaries, counters,
//! workload figures) on top of the engine's decision.

use super::observe::{batch_pods, has_failed, is_ready, pod_info, Observation};
use crate::crd::deployflow::{BatchPhase, DeployFlow, DeployFlowStatus};
use chrono::{DateTime, Utc};
use kube::ResourceExt;

/// Fill in the observed figures and timestamps of a decided status
///
/// `updatedAt` moves only when something else in the status changed, so a
/// pass that changes nothing does not produce a write.
pub fn record(
    flow: &DeployFlow,
    decided: DeployFlowStatus,
    obs: &Observation,
    now: DateTime<Utc>,
) -> DeployFlowStatus {
    let mut status = decided;

    if let Some(workload) = obs.workload.as_ref() {
        let observed = workload.status.clone().unwrap_or_default();
        status.replicas = observed.replicas;
        status.available_replicas = observed.available_replicas;
        status.update_revision = workload.update_revision().map(str::to_string);
    }

    let assigned = batch_pods(
        flow,
        &status.conditions,
        status.started_at.as_deref(),
        status.baseline_replicas,
        obs,
    );

    let mut pods = Vec::new();
    let mut updated = 0;
    let mut updated_ready = 0;
    for (cond, batch) in status.conditions.iter_mut().zip(&assigned) {
        cond.pods = batch.iter().map(|p| pod_info(p)).collect();
        cond.failed_replicas = batch.iter().filter(|p| has_failed(p)).count() as i32;
        updated += batch.len() as i32;
        updated_ready += batch.iter().filter(|p| is_ready(p)).count() as i32;
        pods.extend(batch.iter().map(|p| p.name_any()));
    }
    status.pods = pods;
    status.updated_replicas = updated;
    status.updated_ready_replicas = updated_ready;

    let baked = status
        .conditions
        .iter()
        .filter(|c| c.phase == BatchPhase::Baked);
    status.batches = status.conditions.len() as i32;
    status.finished_batches = baked.clone().count() as i32;
    status.finished_replicas = baked.map(|c| c.batch_size).sum();
    status.failed_replicas = status.conditions.iter().map(|c| c.failed_replicas).sum();

    status.finished = status.phase.is_terminal();
    if status.finished && status.finished_at.is_none() {
        status.finished_at = Some(now.to_rfc3339());
    }

    let previous = flow.status.as_ref();
    let changed = match previous {
        Some(previous) => {
            let mut unchanged = status.clone();
            unchanged.updated_at = previous.updated_at.clone();
            unchanged != *previous
        }
        None => true,
    };
    if changed {
        status.updated_at = Some(now.to_rfc3339());
    }

    status
}
