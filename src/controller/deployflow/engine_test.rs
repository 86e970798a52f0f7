use super::*;
use crate::controller::deployflow::planner::{pending_conditions, plan_batches};
use crate::controller::deployflow::strategy::normalize;
use crate::crd::cloneset::{CloneSet, CloneSetSpec, CloneSetStatus, REVISION_LABEL};
use crate::crd::deployflow::{
    ApplicationSpec, BaseStrategy, DeployFlowSpec, DeployMode, DeployNonUpdateStrategy,
    DeployUpdateStrategy,
};
use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

fn t(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_775_000_000 + seconds, 0).unwrap()
}

fn flow(action: DeployAction, replicas: Option<i32>) -> DeployFlow {
    let mut flow = DeployFlow::new(
        "web-rollout",
        DeployFlowSpec {
            action,
            application: ApplicationSpec {
                cloneset_name: "web".to_string(),
                replicas,
                ..Default::default()
            },
            update_strategy: None,
            non_update_strategy: None,
        },
    );
    flow.metadata.namespace = Some("default".to_string());
    flow
}

/// 100 replicas: canary 10, then three batches of 30
fn auto_strategy() -> DeployUpdateStrategy {
    DeployUpdateStrategy {
        base: BaseStrategy {
            mode: Some(DeployMode::Auto),
            batch_size: Some(IntOrString::Int(30)),
            batches: Some(4),
            ..Default::default()
        },
        canary: 10,
        ..Default::default()
    }
}

fn update_flow(strategy: DeployUpdateStrategy) -> DeployFlow {
    let mut flow = flow(DeployAction::Update, Some(100));
    flow.spec.update_strategy = Some(strategy);
    flow
}

fn cloneset(replicas: i32, revision: &str) -> CloneSet {
    let mut cs = CloneSet::new(
        "web",
        CloneSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        },
    );
    cs.metadata.namespace = Some("default".to_string());
    cs.status = Some(CloneSetStatus {
        replicas,
        update_revision: Some(revision.to_string()),
        ..Default::default()
    });
    cs
}

fn pod(index: usize, revision: &str, ready: bool, since: DateTime<Utc>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("web-{index:03}")),
            labels: Some(BTreeMap::from([(
                REVISION_LABEL.to_string(),
                revision.to_string(),
            )])),
            creation_timestamp: Some(Time(t(0))),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                last_transition_time: Some(Time(since)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// CloneSet of 100 with `updated` ready pods on the new revision
fn observed(updated: usize) -> Observation {
    Observation {
        workload: Some(cloneset(100, "rev-2")),
        pods: (0..updated).map(|i| pod(i, "rev-2", true, t(0))).collect(),
    }
}

/// Status of the 10/30/30/30 plan with the given leading batch phases
fn status_with(phases: &[BatchPhase]) -> DeployFlowStatus {
    let plan = plan_batches(100, 10, Some(&IntOrString::Int(30)), 4).unwrap();
    let mut conditions = pending_conditions(&plan);
    for (cond, phase) in conditions.iter_mut().zip(phases) {
        cond.phase = *phase;
        cond.started_at = Some(t(0).to_rfc3339());
    }
    DeployFlowStatus {
        phase: DeployPhase::BatchStarted,
        replicas_to_process: 100,
        batches: conditions.len() as i32,
        conditions,
        started_at: Some(t(0).to_rfc3339()),
        ..Default::default()
    }
}

fn step(flow: &DeployFlow, status: DeployFlowStatus, obs: &Observation, now: DateTime<Utc>) -> Decision {
    let mut flow = flow.clone();
    flow.status = Some(status);
    let eff = normalize(&flow.spec).unwrap();
    decide(&flow, &eff, obs, now, &ProgressionTimings::default())
}

fn phases(status: &DeployFlowStatus) -> Vec<BatchPhase> {
    status.conditions.iter().map(|c| c.phase).collect()
}

#[test]
fn test_pending_flow_is_planned() {
    let flow = update_flow(auto_strategy());
    let eff = normalize(&flow.spec).unwrap();
    let decision = decide(&flow, &eff, &observed(0), t(0), &ProgressionTimings::default());

    let status = decision.status;
    assert_eq!(status.phase, DeployPhase::Initializing);
    assert_eq!(status.replicas_to_process, 100);
    assert_eq!(status.batches, 4);
    assert_eq!(
        status.conditions.iter().map(|c| c.batch_size).collect::<Vec<_>>(),
        vec![10, 30, 30, 30]
    );
    assert!(status.conditions[0].canary);
    assert!(status.conditions.iter().all(|c| c.phase == BatchPhase::Pending));
    assert_eq!(status.started_at, Some(t(0).to_rfc3339()));
}

#[test]
fn test_first_batch_dispatched_after_planning() {
    let flow = update_flow(auto_strategy());
    let eff = normalize(&flow.spec).unwrap();
    let planned = decide(&flow, &eff, &observed(0), t(0), &ProgressionTimings::default());

    let decision = step(&flow, planned.status, &observed(0), t(1));
    assert_eq!(decision.status.phase, DeployPhase::BatchStarted);
    assert_eq!(phases(&decision.status)[..2], [BatchPhase::Smoking, BatchPhase::Pending]);
    assert_eq!(decision.status.conditions[0].started_at, Some(t(1).to_rfc3339()));
}

#[test]
fn test_complete_batch_is_smoked_then_baking() {
    let flow = update_flow(auto_strategy());

    let smoked = step(&flow, status_with(&[BatchPhase::Smoking]), &observed(10), t(5));
    assert_eq!(smoked.status.conditions[0].phase, BatchPhase::Smoked);

    let baking = step(&flow, smoked.status, &observed(10), t(6));
    let cond = &baking.status.conditions[0];
    assert_eq!(cond.phase, BatchPhase::Baking);
    assert_eq!(cond.pulled_in_at, Some(t(6).to_rfc3339()));
    assert_eq!(baking.requeue_after, Some(Duration::seconds(60)));
}

#[test]
fn test_incomplete_batch_keeps_smoking_until_timeout() {
    let flow = update_flow(auto_strategy());

    let waiting = step(&flow, status_with(&[BatchPhase::Smoking]), &observed(5), t(100));
    assert_eq!(waiting.status.conditions[0].phase, BatchPhase::Smoking);
    assert_eq!(waiting.requeue_after, Some(Duration::seconds(500)));

    let timed_out = step(&flow, status_with(&[BatchPhase::Smoking]), &observed(5), t(600));
    let cond = &timed_out.status.conditions[0];
    assert_eq!(cond.phase, BatchPhase::SmokeFailed);
    assert_eq!(cond.failed_at, Some(t(600).to_rfc3339()));
}

#[test]
fn test_failed_pod_fails_smoking_batch() {
    let flow = update_flow(auto_strategy());
    let mut obs = observed(10);
    if let Some(status) = obs.pods[3].status.as_mut() {
        status.phase = Some("Failed".to_string());
    }

    let decision = step(&flow, status_with(&[BatchPhase::Smoking]), &obs, t(5));
    assert_eq!(decision.status.conditions[0].phase, BatchPhase::SmokeFailed);
    // Failed batch waits for its deadline
    assert_eq!(decision.requeue_after, Some(Duration::seconds(1800)));
}

#[test]
fn test_bake_completes_after_window() {
    let flow = update_flow(auto_strategy());
    let mut status = status_with(&[BatchPhase::Baking]);
    status.conditions[0].pulled_in_at = Some(t(0).to_rfc3339());

    let early = step(&flow, status.clone(), &observed(10), t(30));
    assert_eq!(early.status.conditions[0].phase, BatchPhase::Baking);
    assert_eq!(early.requeue_after, Some(Duration::seconds(30)));

    let done = step(&flow, status, &observed(10), t(60));
    assert_eq!(done.status.conditions[0].phase, BatchPhase::Baked);
    assert_eq!(done.status.conditions[0].finished_at, Some(t(60).to_rfc3339()));
    assert_eq!(done.status.phase, DeployPhase::BatchFinished);
}

#[test]
fn test_unready_pod_fails_bake_and_recovers() {
    let flow = update_flow(auto_strategy());
    let mut status = status_with(&[BatchPhase::Baking]);
    status.conditions[0].pulled_in_at = Some(t(0).to_rfc3339());

    let mut obs = observed(10);
    obs.pods[2] = pod(2, "rev-2", false, t(10));

    let failed = step(&flow, status, &obs, t(20));
    let cond = &failed.status.conditions[0];
    assert_eq!(cond.phase, BatchPhase::BakeFailed);
    assert_eq!(cond.failed_at, Some(t(20).to_rfc3339()));

    // Still sick: stays failed
    let still = step(&flow, failed.status.clone(), &obs, t(30));
    assert_eq!(still.status.conditions[0].phase, BatchPhase::BakeFailed);

    let recovered = step(&flow, failed.status, &observed(10), t(40));
    let cond = &recovered.status.conditions[0];
    assert_eq!(cond.phase, BatchPhase::Baking);
    assert_eq!(cond.pulled_in_at, Some(t(40).to_rfc3339()));
    assert_eq!(cond.failed_at, None);
}

#[test]
fn test_bake_failed_batch_blocks_next_dispatch() {
    let flow = update_flow(auto_strategy());
    let mut status = status_with(&[BatchPhase::Baked, BatchPhase::BakeFailed]);
    status.conditions[1].failed_at = Some(t(0).to_rfc3339());

    let mut obs = observed(40);
    obs.pods[20] = pod(20, "rev-2", false, t(0));

    let decision = step(&flow, status, &obs, t(60));
    assert_eq!(
        phases(&decision.status),
        vec![
            BatchPhase::Baked,
            BatchPhase::BakeFailed,
            BatchPhase::Pending,
            BatchPhase::Pending
        ]
    );
}

#[test]
fn test_first_batch_failing_past_deadline_fails_rollout() {
    let flow = update_flow(auto_strategy());
    let mut status = status_with(&[BatchPhase::SmokeFailed]);
    status.conditions[0].failed_at = Some(t(0).to_rfc3339());

    let decision = step(&flow, status, &observed(5), t(1800));
    assert_eq!(decision.status.phase, DeployPhase::Failed);
    assert!(decision.status.message.is_some());
}

#[test]
fn test_later_batch_failing_past_deadline_aborts_rollout() {
    let flow = update_flow(auto_strategy());
    let mut status = status_with(&[BatchPhase::Baked, BatchPhase::SmokeFailed]);
    status.conditions[1].failed_at = Some(t(0).to_rfc3339());

    let decision = step(&flow, status, &observed(15), t(1800));
    assert_eq!(decision.status.phase, DeployPhase::Aborted);
}

#[test]
fn test_manual_mode_waits_for_stage() {
    let mut strategy = auto_strategy();
    strategy.base.mode = Some(DeployMode::Manual);
    let mut initializing = status_with(&[]);
    initializing.phase = DeployPhase::Initializing;

    let held = step(&update_flow(strategy.clone()), initializing.clone(), &observed(0), t(1));
    assert!(phases(&held.status).iter().all(|p| *p == BatchPhase::Pending));

    strategy.stage = Some(BatchPhase::Smoked);
    let flow = update_flow(strategy);
    let dispatched = step(&flow, initializing, &observed(0), t(1));
    assert_eq!(dispatched.status.conditions[0].phase, BatchPhase::Smoking);

    let smoked = step(&flow, dispatched.status, &observed(10), t(2));
    assert_eq!(smoked.status.conditions[0].phase, BatchPhase::Smoked);

    // Stage Smoked does not allow baking
    let held = step(&flow, smoked.status, &observed(10), t(3));
    assert_eq!(held.status.conditions[0].phase, BatchPhase::Smoked);
}

#[test]
fn test_manual_stage_baked_does_not_start_next_batch() {
    let mut strategy = auto_strategy();
    strategy.base.mode = Some(DeployMode::Manual);
    strategy.stage = Some(BatchPhase::Baked);
    let flow = update_flow(strategy);

    let decision = step(&flow, status_with(&[BatchPhase::Baked]), &observed(10), t(100));
    assert_eq!(decision.status.conditions[1].phase, BatchPhase::Pending);
}

#[test]
fn test_batch_interval_delays_dispatch() {
    let mut strategy = auto_strategy();
    strategy.base.batch_interval_seconds = 120;
    let flow = update_flow(strategy);
    let status = status_with(&[BatchPhase::Baked]);

    let early = step(&flow, status.clone(), &observed(10), t(60));
    assert_eq!(early.status.conditions[1].phase, BatchPhase::Pending);
    assert_eq!(early.requeue_after, Some(Duration::seconds(60)));

    let due = step(&flow, status, &observed(10), t(120));
    assert_eq!(due.status.conditions[1].phase, BatchPhase::Smoking);
}

#[test]
fn test_all_batches_baked_is_success() {
    let flow = update_flow(auto_strategy());
    let status = status_with(&[BatchPhase::Baked; 4]);

    let decision = step(&flow, status, &observed(100), t(500));
    assert_eq!(decision.status.phase, DeployPhase::Success);
    assert_eq!(decision.requeue_after, None);
}

#[test]
fn test_paused_flow_is_frozen() {
    let mut strategy = auto_strategy();
    strategy.base.paused = Some(true);
    let flow = update_flow(strategy);
    let status = status_with(&[BatchPhase::Smoking]);

    let decision = step(&flow, status.clone(), &observed(10), t(5));
    assert!(decision.status.paused);
    assert_eq!(decision.status.conditions, status.conditions);
    assert_eq!(decision.requeue_after, None);
}

#[test]
fn test_canceled_flow_is_terminal() {
    let mut strategy = auto_strategy();
    strategy.base.canceled = true;
    let flow = update_flow(strategy);

    let decision = step(&flow, status_with(&[BatchPhase::Smoking]), &observed(3), t(5));
    assert_eq!(decision.status.phase, DeployPhase::Canceled);
    assert_eq!(decision.status.message.as_deref(), Some("canceled"));
}

#[test]
fn test_terminal_status_is_left_alone() {
    let flow = update_flow(auto_strategy());
    let mut status = status_with(&[BatchPhase::Baked; 4]);
    status.phase = DeployPhase::Success;
    status.finished = true;

    let decision = step(&flow, status.clone(), &observed(0), t(5));
    assert_eq!(decision.status, status);
}

#[test]
fn test_missing_cloneset_halts_update() {
    let flow = update_flow(auto_strategy());
    let obs = Observation::default();

    let decision = step(&flow, DeployFlowStatus::default(), &obs, t(0));
    assert_eq!(decision.status.phase, DeployPhase::Pending);
    assert_eq!(decision.status.message.as_deref(), Some("CloneSet web not found"));
}

#[test]
fn test_create_refuses_existing_cloneset() {
    let mut flow = flow(DeployAction::Create, Some(3));
    flow.spec.non_update_strategy = Some(DeployNonUpdateStrategy::default());

    let decision = step(&flow, DeployFlowStatus::default(), &observed(0), t(0));
    assert_eq!(decision.status.phase, DeployPhase::Pending);
    assert!(decision
        .status
        .message
        .as_deref()
        .is_some_and(|m| m.contains("already exists")));
}

#[test]
fn test_scale_replicas_relative_to_baseline() {
    let obs = Observation {
        workload: Some(cloneset(5, "rev-1")),
        pods: Vec::new(),
    };

    let out = flow(DeployAction::Scale, Some(8));
    let eff = normalize(&out.spec).unwrap();
    assert_eq!(initial_replicas(&out, &eff, &obs), (3, Some(5)));

    let down = flow(DeployAction::ScaleIn, Some(2));
    let eff = normalize(&down.spec).unwrap();
    assert_eq!(initial_replicas(&down, &eff, &obs), (3, Some(5)));
}

#[test]
fn test_restart_processes_listed_pods_only() {
    let mut restart = flow(DeployAction::Restart, None);
    restart.spec.non_update_strategy = Some(DeployNonUpdateStrategy {
        pods_to_delete: Some(vec!["web-001".to_string(), "web-002".to_string()]),
        ..Default::default()
    });
    let eff = normalize(&restart.spec).unwrap();
    assert_eq!(initial_replicas(&restart, &eff, &observed(0)), (2, None));

    let everything = flow(DeployAction::Restart, None);
    let eff = normalize(&everything.spec).unwrap();
    assert_eq!(initial_replicas(&everything, &eff, &observed(0)), (100, None));
}

#[test]
fn test_scale_in_batch_completes_when_cloneset_shrinks() {
    let mut scale = flow(DeployAction::ScaleIn, Some(2));
    scale.spec.non_update_strategy = Some(DeployNonUpdateStrategy {
        base: BaseStrategy {
            batches: Some(1),
            ..Default::default()
        },
        ..Default::default()
    });
    let mut status = DeployFlowStatus {
        phase: DeployPhase::BatchStarted,
        replicas_to_process: 3,
        baseline_replicas: Some(5),
        started_at: Some(t(0).to_rfc3339()),
        batches: 1,
        conditions: vec![BatchCondition {
            batch: 1,
            batch_size: 3,
            phase: BatchPhase::Smoking,
            started_at: Some(t(0).to_rfc3339()),
            ..Default::default()
        }],
        ..Default::default()
    };

    let shrinking = Observation {
        workload: Some(cloneset(5, "rev-1")),
        pods: Vec::new(),
    };
    let waiting = step(&scale, status.clone(), &shrinking, t(5));
    assert_eq!(waiting.status.conditions[0].phase, BatchPhase::Smoking);

    let shrunk = Observation {
        workload: Some(cloneset(2, "rev-1")),
        pods: Vec::new(),
    };
    let done = step(&scale, status.clone(), &shrunk, t(5));
    assert_eq!(done.status.conditions[0].phase, BatchPhase::Smoked);

    status.conditions[0].phase = BatchPhase::Baked;
    let finished = step(&scale, status, &shrunk, t(100));
    assert_eq!(finished.status.phase, DeployPhase::Success);
}

#[test]
fn test_phase_changed_compares_batches() {
    let before = status_with(&[BatchPhase::Smoking]);
    assert!(!phase_changed(Some(&before), &before));
    assert!(phase_changed(None, &before));

    let after = status_with(&[BatchPhase::Smoked]);
    assert!(phase_changed(Some(&before), &after));
}
