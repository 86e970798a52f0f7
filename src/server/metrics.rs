//! Prometheus metrics for the DeployFlow controller
//!
//! - `triton_reconciliations_total{result, action}`: passes by outcome
//!   (`success`, `error`, `skipped`)
//! - `triton_reconcile_duration_seconds{action}`: pass latency
//! - `triton_actuations_total{kind}`: substrate writes by kind
//! - `triton_deployflow_phase{namespace, name, phase}`: 1 for the current
//!   phase of each rollout, 0 for the others

use crate::crd::deployflow::DeployPhase;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

const PHASES: &[DeployPhase] = &[
    DeployPhase::Pending,
    DeployPhase::Initializing,
    DeployPhase::BatchStarted,
    DeployPhase::BatchFinished,
    DeployPhase::Success,
    DeployPhase::Failed,
    DeployPhase::Aborted,
    DeployPhase::Canceled,
];

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    actuations: IntCounterVec,
    phase: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "triton_reconciliations_total",
                "DeployFlow reconcile passes by result",
            ),
            &["result", "action"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "triton_reconcile_duration_seconds",
                "Duration of a DeployFlow reconcile pass",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["action"],
        )?;
        let actuations = IntCounterVec::new(
            Opts::new("triton_actuations_total", "Substrate writes by kind"),
            &["kind"],
        )?;
        let phase = IntGaugeVec::new(
            Opts::new("triton_deployflow_phase", "Current phase of each DeployFlow"),
            &["namespace", "name", "phase"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(actuations.clone()))?;
        registry.register(Box::new(phase.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            actuations,
            phase,
        })
    }

    pub fn record_reconciliation_success(&self, action: &str, duration_secs: f64) {
        self.reconciliations
            .with_label_values(&["success", action])
            .inc();
        self.reconcile_duration
            .with_label_values(&[action])
            .observe(duration_secs);
    }

    /// The duration of a failed pass is unknown; pass 0 to skip the histogram
    pub fn record_reconciliation_error(&self, action: &str, duration_secs: f64) {
        self.reconciliations.with_label_values(&["error", action]).inc();
        if duration_secs > 0.0 {
            self.reconcile_duration
                .with_label_values(&[action])
                .observe(duration_secs);
        }
    }

    /// A pass skipped because this replica is not the leader
    pub fn record_reconciliation_skipped(&self) {
        self.reconciliations.with_label_values(&["skipped", ""]).inc();
    }

    pub fn record_actuation(&self, kind: &str) {
        self.actuations.with_label_values(&[kind]).inc();
    }

    pub fn set_phase(&self, namespace: &str, name: &str, current: &str) {
        for phase in PHASES {
            let value = i64::from(phase.as_str() == current);
            self.phase
                .with_label_values(&[namespace, name, phase.as_str()])
                .set(value);
        }
    }

    /// Prometheus text exposition
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
