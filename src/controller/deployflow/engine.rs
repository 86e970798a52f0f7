//! Progression engine
//!
//! Pure state machine advancing a DeployFlow one step per pass. Given the
//! normalized strategy, the observation and the current time it returns the
//! next status plus the earliest moment a timer needs another look. All I/O
//! lives in the actuator and the reconcile loop.

use super::observe::{
    batch_pods, has_failed, is_ready, not_ready_since, parse_time, scale_direction,
    Observation, ScaleDirection,
};
use super::planner::{merge_plan, pending_conditions, plan_batches, replan_batches};
use super::strategy::EffectiveStrategy;
use crate::crd::deployflow::{
    BatchCondition, BatchPhase, DeployAction, DeployFlow, DeployFlowStatus, DeployPhase,
};
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

/// Timers governing batch progression
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressionTimings {
    /// How long a pulled-in batch must stay healthy before it is Baked
    pub bake: Duration,
    /// How long a baking pod may be not-ready before the batch fails
    pub bake_failure_grace: Duration,
    /// Smoking batches that are still incomplete after this fail
    pub smoke_timeout: Option<Duration>,
    /// Batches failed for this long fail the whole rollout
    pub failed_batch_timeout: Option<Duration>,
}

impl Default for ProgressionTimings {
    fn default() -> Self {
        Self {
            bake: Duration::seconds(60),
            bake_failure_grace: Duration::zero(),
            smoke_timeout: Some(Duration::seconds(600)),
            failed_batch_timeout: Some(Duration::seconds(1800)),
        }
    }
}

/// Outcome of one engine step
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub status: DeployFlowStatus,
    /// Time until the earliest pending timer, if any
    pub requeue_after: Option<Duration>,
}

/// Replicas this rollout processes and, for scale actions, the replicas it starts from
pub fn initial_replicas(
    flow: &DeployFlow,
    eff: &EffectiveStrategy,
    obs: &Observation,
) -> (i32, Option<i32>) {
    let app_replicas = flow.spec.application.replicas;
    let workload_replicas = obs.workload_replicas();
    match flow.spec.action {
        DeployAction::Update | DeployAction::Rollback => {
            (app_replicas.or(workload_replicas).unwrap_or(0), None)
        }
        DeployAction::Create => (app_replicas.unwrap_or(1), None),
        DeployAction::Restart => {
            if eff.pods_to_delete.is_empty() {
                (workload_replicas.unwrap_or(0), None)
            } else {
                (eff.pods_to_delete.len() as i32, None)
            }
        }
        DeployAction::Scale | DeployAction::ScaleIn | DeployAction::ScaleOut => {
            let baseline = workload_replicas.unwrap_or(0);
            let target = app_replicas.unwrap_or(baseline);
            ((target - baseline).abs(), Some(baseline))
        }
    }
}

/// Advance the rollout by at most one step
pub fn decide(
    flow: &DeployFlow,
    eff: &EffectiveStrategy,
    obs: &Observation,
    now: DateTime<Utc>,
    timings: &ProgressionTimings,
) -> Decision {
    let mut status = flow.status.clone().unwrap_or_default();
    let mut timers = Timers::default();

    if status.finished || status.phase.is_terminal() {
        return Decision {
            status,
            requeue_after: None,
        };
    }

    status.paused = eff.paused;

    if eff.canceled {
        info!(deployflow = ?flow.metadata.name, "Rollout canceled");
        status.phase = DeployPhase::Canceled;
        status.message = Some("canceled".to_string());
        return Decision {
            status,
            requeue_after: None,
        };
    }

    let cloneset = &flow.spec.application.cloneset_name;
    match (&obs.workload, flow.spec.action) {
        (None, DeployAction::Create) => {}
        (None, _) => {
            status.message = Some(format!("CloneSet {cloneset} not found"));
            return Decision {
                status,
                requeue_after: None,
            };
        }
        (Some(_), DeployAction::Create) if status.phase == DeployPhase::Pending => {
            status.message = Some(format!("CloneSet {cloneset} already exists"));
            return Decision {
                status,
                requeue_after: None,
            };
        }
        _ => {}
    }

    if eff.paused {
        debug!(deployflow = ?flow.metadata.name, "Rollout paused");
        return Decision {
            status,
            requeue_after: None,
        };
    }

    status.message = None;

    if status.phase == DeployPhase::Pending {
        initialize(flow, eff, obs, now, &mut status);
        return Decision {
            status,
            requeue_after: None,
        };
    }

    if let Err(message) = replan(eff, &mut status) {
        status.message = Some(message);
    }

    let assigned = batch_pods(
        flow,
        &status.conditions,
        status.started_at.as_deref(),
        status.baseline_replicas,
        obs,
    );

    let active = status
        .conditions
        .iter()
        .position(|c| !matches!(c.phase, BatchPhase::Pending | BatchPhase::Baked));

    match active {
        Some(index) => {
            let batch = BatchView {
                flow,
                obs,
                index,
                pods: &assigned[index],
            };
            step_batch(&batch, eff, now, timings, &mut status, &mut timers);
        }
        None => dispatch_or_finish(eff, now, &mut status, &mut timers),
    }

    Decision {
        status,
        requeue_after: timers.earliest(),
    }
}

/// Plan the batches and fix the replicas to process
fn initialize(
    flow: &DeployFlow,
    eff: &EffectiveStrategy,
    obs: &Observation,
    now: DateTime<Utc>,
    status: &mut DeployFlowStatus,
) {
    let (total, baseline) = initial_replicas(flow, eff, obs);
    match plan_batches(total, eff.canary, eff.batch_size.as_ref(), eff.batches) {
        Ok(plan) => {
            info!(
                deployflow = ?flow.metadata.name,
                action = %flow.spec.action,
                replicas = total,
                batches = plan.len(),
                "Planned rollout"
            );
            status.conditions = pending_conditions(&plan);
            status.batches = plan.len() as i32;
            status.replicas_to_process = total;
            status.baseline_replicas = baseline;
            status.started_at = Some(now.to_rfc3339());
            status.phase = DeployPhase::Initializing;
        }
        Err(e) => {
            warn!(deployflow = ?flow.metadata.name, error = %e, "Cannot plan rollout");
            status.message = Some(e.to_string());
        }
    }
}

/// Re-plan the pending tail against the current strategy
fn replan(eff: &EffectiveStrategy, status: &mut DeployFlowStatus) -> Result<(), String> {
    let plan = replan_batches(
        &status.conditions,
        status.replicas_to_process,
        eff.canary,
        eff.batch_size.as_ref(),
        eff.batches,
    )
    .map_err(|e| e.to_string())?;

    if let Some(merged) = merge_plan(&status.conditions, &plan) {
        debug!(batches = merged.len(), "Pending batches re-planned");
        status.batches = merged.len() as i32;
        status.conditions = merged;
    }
    Ok(())
}

struct BatchView<'a> {
    flow: &'a DeployFlow,
    obs: &'a Observation,
    index: usize,
    pods: &'a [&'a Pod],
}

impl BatchView<'_> {
    fn scale_in(&self, status: &DeployFlowStatus) -> bool {
        self.flow.spec.action.is_scale()
            && scale_direction(self.flow, status.baseline_replicas.unwrap_or(0))
                == ScaleDirection::In
    }

    /// Pods the batch should end up with
    fn expected_pods(&self, status: &DeployFlowStatus) -> usize {
        if self.scale_in(status) {
            0
        } else {
            status.conditions[self.index].batch_size.max(0) as usize
        }
    }

    /// Every replica of the batch exists and is ready
    fn complete(&self, status: &DeployFlowStatus) -> bool {
        if self.scale_in(status) {
            let removed: i32 = status.conditions[..=self.index]
                .iter()
                .map(|c| c.batch_size)
                .sum();
            let target = status.baseline_replicas.unwrap_or(0) - removed;
            return self
                .obs
                .workload
                .as_ref()
                .and_then(|cs| cs.status.as_ref())
                .is_some_and(|s| s.replicas <= target);
        }
        self.pods.len() >= self.expected_pods(status) && self.pods.iter().all(|p| is_ready(p))
    }
}

/// One sub-transition of the active batch
fn step_batch(
    batch: &BatchView<'_>,
    eff: &EffectiveStrategy,
    now: DateTime<Utc>,
    timings: &ProgressionTimings,
    status: &mut DeployFlowStatus,
    timers: &mut Timers,
) {
    let complete = batch.complete(status);
    let expected = batch.expected_pods(status);
    let any_failed = batch.pods.iter().any(|p| has_failed(p));
    let name = &batch.flow.metadata.name;
    let number = status.conditions[batch.index].batch;
    let stamp = now.to_rfc3339();

    let cond = &mut status.conditions[batch.index];
    match cond.phase {
        BatchPhase::Smoking => {
            if any_failed {
                warn!(deployflow = ?name, batch = number, "Batch pods failed while smoking");
                fail(cond, BatchPhase::SmokeFailed, &stamp);
            } else if complete {
                if eff.stage_allows(BatchPhase::Smoked) {
                    info!(deployflow = ?name, batch = number, "Batch smoked");
                    cond.phase = BatchPhase::Smoked;
                }
            } else if let Some(timeout) = timings.smoke_timeout {
                let started = parse_time(cond.started_at.as_deref()).unwrap_or(now);
                let deadline = started + timeout;
                if now >= deadline {
                    warn!(deployflow = ?name, batch = number, "Batch did not become ready in time");
                    fail(cond, BatchPhase::SmokeFailed, &stamp);
                } else {
                    timers.at(deadline, now);
                }
            }
        }
        BatchPhase::Smoked => {
            if eff.stage_allows(BatchPhase::Baking) {
                info!(deployflow = ?name, batch = number, "Batch baking");
                cond.phase = BatchPhase::Baking;
                cond.pulled_in_at = Some(stamp);
                timers.at(now + timings.bake, now);
            }
        }
        BatchPhase::Baking => {
            let unhealthy = bake_violation(batch.pods, expected, now, timings, timers);
            if unhealthy {
                warn!(deployflow = ?name, batch = number, "Batch unhealthy while baking");
                fail(cond, BatchPhase::BakeFailed, &stamp);
            } else {
                let pulled_in = parse_time(cond.pulled_in_at.as_deref()).unwrap_or(now);
                let baked_at = pulled_in + timings.bake;
                if now < baked_at {
                    timers.at(baked_at, now);
                } else if eff.stage_allows(BatchPhase::Baked) {
                    info!(deployflow = ?name, batch = number, "Batch baked");
                    cond.phase = BatchPhase::Baked;
                    cond.finished_at = Some(stamp);
                    if status.phase == DeployPhase::BatchStarted {
                        status.phase = DeployPhase::BatchFinished;
                    }
                }
            }
        }
        BatchPhase::SmokeFailed => {
            if complete && !any_failed {
                info!(deployflow = ?name, batch = number, "Batch recovered, smoking again");
                cond.phase = BatchPhase::Smoking;
                cond.failed_at = None;
            }
        }
        BatchPhase::BakeFailed => {
            if batch.pods.len() >= expected && batch.pods.iter().all(|p| is_ready(p)) {
                info!(deployflow = ?name, batch = number, "Batch recovered, baking again");
                cond.phase = BatchPhase::Baking;
                cond.pulled_in_at = Some(stamp);
                cond.failed_at = None;
                timers.at(now + timings.bake, now);
            }
        }
        BatchPhase::Pending | BatchPhase::Baked => {}
    }

    let cond = &status.conditions[batch.index];
    if cond.phase.is_failed() {
        if let Some(timeout) = timings.failed_batch_timeout {
            let failed_at = parse_time(cond.failed_at.as_deref()).unwrap_or(now);
            let deadline = failed_at + timeout;
            if now >= deadline {
                give_up(status, number);
            } else {
                timers.at(deadline, now);
            }
        }
    }
}

fn fail(cond: &mut BatchCondition, phase: BatchPhase, stamp: &str) {
    cond.phase = phase;
    cond.failed_at = Some(stamp.to_string());
}

/// Fail the rollout after a batch stayed failed too long
fn give_up(status: &mut DeployFlowStatus, batch: i32) {
    let finished: i32 = status
        .conditions
        .iter()
        .filter(|c| c.phase == BatchPhase::Baked)
        .map(|c| c.batch_size)
        .sum();
    status.phase = if finished == 0 {
        DeployPhase::Failed
    } else {
        DeployPhase::Aborted
    };
    status.message = Some(format!("batch {batch} stayed failed past its deadline"));
    warn!(batch, phase = status.phase.as_str(), "Rollout gave up on failed batch");
}

/// A baking batch lost a pod or has one not ready past the grace period
fn bake_violation(
    pods: &[&Pod],
    expected: usize,
    now: DateTime<Utc>,
    timings: &ProgressionTimings,
    timers: &mut Timers,
) -> bool {
    if pods.len() < expected {
        return true;
    }
    for pod in pods {
        if let Some(since) = not_ready_since(pod) {
            let deadline = since + timings.bake_failure_grace;
            if now >= deadline {
                return true;
            }
            timers.at(deadline, now);
        }
    }
    false
}

/// Dispatch the next pending batch, or finish when every batch is baked
fn dispatch_or_finish(
    eff: &EffectiveStrategy,
    now: DateTime<Utc>,
    status: &mut DeployFlowStatus,
    timers: &mut Timers,
) {
    let Some(next) = status
        .conditions
        .iter()
        .position(|c| c.phase == BatchPhase::Pending)
    else {
        info!(batches = status.conditions.len(), "All batches baked");
        status.phase = DeployPhase::Success;
        return;
    };

    if next > 0 && eff.batch_interval_seconds > 0 {
        let previous = parse_time(status.conditions[next - 1].started_at.as_deref());
        if let Some(previous) = previous {
            let earliest = previous + Duration::seconds(eff.batch_interval_seconds);
            if now < earliest {
                timers.at(earliest, now);
                return;
            }
        }
    }

    if !eff.dispatch_allowed() {
        debug!(batch = next + 1, "Waiting for stage to allow dispatch");
        return;
    }

    let cond = &mut status.conditions[next];
    info!(batch = cond.batch, size = cond.batch_size, canary = cond.canary, "Dispatching batch");
    cond.phase = BatchPhase::Smoking;
    cond.started_at = Some(now.to_rfc3339());
    status.phase = DeployPhase::BatchStarted;
}

/// Earliest of the timers seen during a step
#[derive(Default)]
struct Timers(Option<Duration>);

impl Timers {
    fn at(&mut self, when: DateTime<Utc>, now: DateTime<Utc>) {
        let remaining = when - now;
        self.0 = Some(match self.0 {
            Some(current) => current.min(remaining),
            None => remaining,
        });
    }

    fn earliest(&self) -> Option<Duration> {
        self.0
    }
}

/// Whether the step moved any phase forward or back
pub fn phase_changed(before: Option<&DeployFlowStatus>, after: &DeployFlowStatus) -> bool {
    let Some(before) = before else {
        return true;
    };
    before.phase != after.phase
        || before.conditions.len() != after.conditions.len()
        || before
            .conditions
            .iter()
            .zip(&after.conditions)
            .any(|(a, b)| a.phase != b.phase)
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
