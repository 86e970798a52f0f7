//! Strategy normalization
//!
//! Resolves the Action into the strategy shape it requires, then merges the
//! shared base fields with the action-specific ones into one
//! [`EffectiveStrategy`] used for the rest of the pass.

use super::validation::ValidationError;
use crate::crd::deployflow::{
    BaseStrategy, BatchPhase, DeployAction, DeployFlowSpec, DeployMode, DeployNonUpdateStrategy,
    DeployUpdateStrategy,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Strategy bound to the DeployFlow's Action
///
/// `None` inside a variant means the strategy was omitted and every field
/// takes its default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActionStrategy<'a> {
    Update(Option<&'a DeployUpdateStrategy>),
    NonUpdate(Option<&'a DeployNonUpdateStrategy>),
}

impl<'a> ActionStrategy<'a> {
    /// Pick the variant from the Action, rejecting a strategy of the other shape
    pub fn resolve(spec: &'a DeployFlowSpec) -> Result<Self, ValidationError> {
        if spec.action.revision_changed() {
            if spec.non_update_strategy.is_some() {
                return Err(ValidationError::StrategyMismatch {
                    action: spec.action,
                    expected: "updateStrategy",
                    found: "nonUpdateStrategy",
                });
            }
            Ok(ActionStrategy::Update(spec.update_strategy.as_ref()))
        } else {
            if spec.update_strategy.is_some() {
                return Err(ValidationError::StrategyMismatch {
                    action: spec.action,
                    expected: "nonUpdateStrategy",
                    found: "updateStrategy",
                });
            }
            Ok(ActionStrategy::NonUpdate(spec.non_update_strategy.as_ref()))
        }
    }

    pub fn base(&self) -> Option<&'a BaseStrategy> {
        match self {
            ActionStrategy::Update(s) => s.map(|s| &s.base),
            ActionStrategy::NonUpdate(s) => s.map(|s| &s.base),
        }
    }
}

/// Merged strategy for one reconcile pass
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveStrategy {
    pub action: DeployAction,
    pub paused: bool,
    pub canceled: bool,
    pub batch_size: Option<IntOrString>,
    pub batch_interval_seconds: i64,
    pub mode: DeployMode,
    pub batches: i32,
    pub canary: i32,
    pub stage: Option<BatchPhase>,
    pub no_pull_in: bool,
    pub pods_to_delete: Vec<String>,
}

impl EffectiveStrategy {
    pub fn revision_change(&self) -> bool {
        self.action.revision_changed()
    }

    /// Whether a batch may move forward into `target`
    ///
    /// Auto mode always may. Manual mode needs the operator's stage at or
    /// beyond the target phase.
    pub fn stage_allows(&self, target: BatchPhase) -> bool {
        if self.mode == DeployMode::Auto {
            return true;
        }
        match (self.stage.and_then(|s| s.rank()), target.rank()) {
            (Some(stage), Some(target)) => stage >= target,
            _ => false,
        }
    }

    /// Whether a new batch may be dispatched
    ///
    /// Manual mode dispatches only while the operator asks for a smoke
    /// stage, so a stage left at `Baked` never starts the next batch.
    pub fn dispatch_allowed(&self) -> bool {
        match self.mode {
            DeployMode::Auto => true,
            DeployMode::Manual => {
                matches!(self.stage, Some(BatchPhase::Smoking | BatchPhase::Smoked))
            }
        }
    }
}

/// Normalize the DeployFlow's strategy into an [`EffectiveStrategy`]
///
/// Defaults: not paused, one batch, manual mode for update strategies.
/// Non-update strategies have no stage and always advance automatically.
pub fn normalize(spec: &DeployFlowSpec) -> Result<EffectiveStrategy, ValidationError> {
    let strategy = ActionStrategy::resolve(spec)?;
    let base = strategy.base().cloned().unwrap_or_default();

    let batches = match base.batches {
        Some(n) if n > 0 => n,
        _ => 1,
    };

    let mut effective = EffectiveStrategy {
        action: spec.action,
        paused: base.paused.unwrap_or(false),
        canceled: base.canceled,
        batch_size: base.batch_size,
        batch_interval_seconds: i64::from(base.batch_interval_seconds.max(0)),
        mode: base.mode.unwrap_or(DeployMode::Manual),
        batches,
        canary: 0,
        stage: None,
        no_pull_in: false,
        pods_to_delete: Vec::new(),
    };

    match strategy {
        ActionStrategy::Update(update) => {
            if let Some(update) = update {
                effective.canary = update.canary.max(0);
                effective.stage = update.stage;
                effective.no_pull_in = update.no_pull_in;
            }
        }
        ActionStrategy::NonUpdate(non_update) => {
            effective.mode = DeployMode::Auto;
            if let Some(pods) = non_update.and_then(|s| s.pods_to_delete.as_ref()) {
                effective.pods_to_delete = pods.clone();
            }
        }
    }

    Ok(effective)
}
