use super::actuator::{apply, plan_actuations, Actuation};
use super::engine::{decide, phase_changed};
use super::observe::Observation;
use super::status::record;
use super::strategy::normalize;
use super::validation::{validate_spec, ValidationError};
use super::workload::{KubeWorkloadClient, WorkloadClient, WorkloadError};
use crate::config::ControllerConfig;
use crate::controller::clock::{Clock, SystemClock};
use crate::crd::deployflow::{DeployFlow, DeployFlowStatus};
use crate::server::{LeaderState, SharedMetrics};
use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Requeue after any phase moved
pub const PHASE_CHANGE_REQUEUE: Duration = Duration::from_secs(1);
/// Bounds for timer-driven requeues
pub const MIN_REQUEUE: Duration = Duration::from_secs(1);
pub const MAX_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue while another replica holds the lease
pub const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("DeployFlow missing namespace")]
    MissingNamespace,

    #[error("Invalid DeployFlow spec: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Workload error: {0}")]
    WorkloadError(#[from] WorkloadError),

    #[error("Status of {0} changed underneath us")]
    Conflict(String),
}

impl ReconcileError {
    /// Worth retrying without a change to the object
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::KubeError(_) | ReconcileError::Conflict(_) => true,
            ReconcileError::WorkloadError(e) => !matches!(e, WorkloadError::Serialization(_)),
            ReconcileError::MissingNamespace | ReconcileError::ValidationError(_) => false,
        }
    }
}

/// Per-object exponential backoff for transient failures
#[derive(Default)]
pub struct Backoff {
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    /// Delay before the next attempt, doubling from 5s up to 5min
    pub fn next(&self, key: &str) -> Duration {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = BACKOFF_BASE
            .checked_mul(1u32 << (*count).min(16))
            .unwrap_or(BACKOFF_CAP)
            .min(BACKOFF_CAP);
        *count = count.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.remove(key);
    }
}

pub struct Context {
    pub client: kube::Client,
    pub workloads: Arc<dyn WorkloadClient>,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
    /// When Some, reconciliation is skipped unless this replica leads
    pub leader_state: Option<LeaderState>,
    pub metrics: Option<SharedMetrics>,
    pub backoff: Backoff,
}

impl Context {
    /// Single instance mode
    pub fn new(
        client: kube::Client,
        config: ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            workloads: Arc::new(KubeWorkloadClient::new(client.clone())),
            client,
            clock: Arc::new(SystemClock),
            config,
            leader_state: None,
            metrics,
            backoff: Backoff::default(),
        }
    }

    /// Reconciliation only runs while `leader_state` reports leadership
    pub fn new_with_leader(
        client: kube::Client,
        config: ControllerConfig,
        leader_state: LeaderState,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            leader_state: Some(leader_state),
            ..Self::new(client, config, metrics)
        }
    }

    pub fn should_reconcile(&self) -> bool {
        match &self.leader_state {
            None => true,
            Some(state) => state.is_leader(),
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub fn new_mock() -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        // The client is never reached in unit tests
        let mut config = kube::Config::new("https://localhost:8080".parse().unwrap());
        config.default_namespace = "default".to_string();
        config.accept_invalid_certs = true;
        let client = kube::Client::try_from(config).unwrap();

        Context {
            client,
            workloads: Arc::new(super::workload::MockWorkloadClient::new()),
            clock: Arc::new(SystemClock),
            config: ControllerConfig::default(),
            leader_state: None,
            metrics: None,
            backoff: Backoff::default(),
        }
    }

    #[cfg(test)]
    pub fn new_mock_with_leader(leader_state: LeaderState) -> Self {
        Context {
            leader_state: Some(leader_state),
            ..Self::new_mock()
        }
    }
}

/// Result of one pass over a DeployFlow
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    pub status: DeployFlowStatus,
    /// `None` waits for the next change of the object
    pub requeue: Option<Duration>,
    pub actuations: Vec<Actuation>,
}

/// Normalize, observe, decide, act and record, in that order
///
/// Nothing is written to the DeployFlow itself; the caller persists the
/// returned status.
pub async fn run_pass(
    flow: &DeployFlow,
    workloads: &dyn WorkloadClient,
    now: DateTime<Utc>,
    config: &ControllerConfig,
) -> Result<PassOutcome, ReconcileError> {
    let namespace = flow.namespace().ok_or(ReconcileError::MissingNamespace)?;

    if let Err(e) = validate_spec(&flow.spec) {
        warn!(deployflow = %flow.name_any(), error = %e, "Refusing to act on invalid spec");
        let mut status = flow.status.clone().unwrap_or_default();
        status.message = Some(e.to_string());
        return Ok(PassOutcome {
            status,
            requeue: None,
            actuations: Vec::new(),
        });
    }
    let eff = normalize(&flow.spec)?;

    let obs = Observation::capture(workloads, &namespace, flow).await?;
    let decision = decide(flow, &eff, &obs, now, &config.timings());

    let actuations = plan_actuations(flow, &eff, &decision.status, &obs);
    apply(workloads, &namespace, flow, &actuations).await?;

    let status = record(flow, decision.status, &obs, now);
    let requeue = if status.finished {
        None
    } else if phase_changed(flow.status.as_ref(), &status) {
        Some(PHASE_CHANGE_REQUEUE)
    } else {
        Some(match decision.requeue_after {
            Some(timer) => clamp_requeue(timer),
            None => config.resync,
        })
    };

    Ok(PassOutcome {
        status,
        requeue,
        actuations,
    })
}

/// Timer durations bounded to [1s, 5min]
pub fn clamp_requeue(timer: chrono::Duration) -> Duration {
    timer
        .to_std()
        .unwrap_or(MIN_REQUEUE)
        .clamp(MIN_REQUEUE, MAX_REQUEUE)
}

/// Reconcile a DeployFlow
///
/// Reads the latest copy of the object, runs one pass and writes the status
/// back with the read resourceVersion as a precondition. A concurrent write
/// surfaces as [`ReconcileError::Conflict`] and is retried quickly.
pub async fn reconcile(flow: Arc<DeployFlow>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if !ctx.should_reconcile() {
        debug!(deployflow = ?flow.name_any(), "Skipping reconciliation - not leader");
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_reconciliation_skipped();
        }
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let start_time = std::time::Instant::now();
    let namespace = flow.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = flow.name_any();
    let key = format!("{namespace}/{name}");

    let api: Api<DeployFlow> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(flow) = api.get_opt(&name).await? else {
        debug!(deployflow = %key, "DeployFlow gone");
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    };

    if flow.status.as_ref().is_some_and(|s| s.finished) {
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    info!(deployflow = %name, namespace = %namespace, action = %flow.spec.action, "Reconciling DeployFlow");

    let outcome = run_pass(&flow, ctx.workloads.as_ref(), ctx.clock.now(), &ctx.config).await?;

    if flow.status.as_ref() != Some(&outcome.status) {
        info!(
            deployflow = %name,
            phase = outcome.status.phase.as_str(),
            finished_batches = outcome.status.finished_batches,
            batches = outcome.status.batches,
            "Updating DeployFlow status"
        );
        write_status(&api, &flow, &outcome.status).await?;
    }

    if let Some(ref metrics) = ctx.metrics {
        for actuation in &outcome.actuations {
            metrics.record_actuation(actuation.kind());
        }
        metrics.set_phase(&namespace, &name, outcome.status.phase.as_str());
        metrics.record_reconciliation_success(
            flow.spec.action.as_str(),
            start_time.elapsed().as_secs_f64(),
        );
    }
    ctx.backoff.reset(&key);

    Ok(match outcome.requeue {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

/// Status merge patch with explicit nulls for cleared optional fields
pub fn status_patch(flow: &DeployFlow, status: &DeployFlowStatus) -> serde_json::Value {
    let mut body = serde_json::to_value(status).unwrap_or_default();
    if let Some(map) = body.as_object_mut() {
        for field in [
            "message",
            "updateRevision",
            "baselineReplicas",
            "startedAt",
            "finishedAt",
        ] {
            map.entry(field).or_insert(serde_json::Value::Null);
        }
    }
    serde_json::json!({
        "metadata": { "resourceVersion": flow.resource_version() },
        "status": body,
    })
}

async fn write_status(
    api: &Api<DeployFlow>,
    flow: &DeployFlow,
    status: &DeployFlowStatus,
) -> Result<(), ReconcileError> {
    let name = flow.name_any();
    let patch = status_patch(flow, status);
    match api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => Err(ReconcileError::Conflict(name)),
        Err(e) => Err(e.into()),
    }
}

/// Requeue policy for failed reconciliations
///
/// Conflicts retry after a second, other transient errors back off
/// exponentially, permanent errors wait for the object to change.
pub fn error_policy(flow: Arc<DeployFlow>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(deployflow = %flow.name_any(), error = %error, "Reconcile error");

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconciliation_error(flow.spec.action.as_str(), 0.0);
    }

    let key = format!(
        "{}/{}",
        flow.namespace().unwrap_or_default(),
        flow.name_any()
    );
    match error {
        ReconcileError::Conflict(_) => Action::requeue(PHASE_CHANGE_REQUEUE),
        e if e.is_retryable() => Action::requeue(ctx.backoff.next(&key)),
        _ => Action::await_change(),
    }
}
