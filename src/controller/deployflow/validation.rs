use super::strategy::ActionStrategy;
use crate::crd::deployflow::{BaseStrategy, BatchPhase, DeployAction, DeployFlow, DeployFlowSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use thiserror::Error;

/// Reasons a DeployFlow is rejected at the mutation boundary
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("action {action} requires {expected}, found {found}")]
    StrategyMismatch {
        action: DeployAction,
        expected: &'static str,
        found: &'static str,
    },

    #[error("application.clonesetName cannot be empty")]
    MissingCloneSetName,

    #[error("application.replicas must be >= 0, got {0}")]
    NegativeReplicas(i32),

    #[error("action {0} requires application.replicas")]
    MissingReplicas(DeployAction),

    #[error("batchSize must be a positive number or a percentage in 1%..100%, got {0}")]
    InvalidBatchSize(String),

    #[error("batches must be >= 0, got {0}")]
    InvalidBatches(i32),

    #[error("batchIntervalSeconds must be >= 0, got {0}")]
    NegativeInterval(i32),

    #[error("canary must be between 0 and replicas ({replicas}), got {canary}")]
    InvalidCanary { canary: i32, replicas: i32 },

    #[error("stage cannot be a failure phase, got {0:?}")]
    InvalidStage(BatchPhase),

    #[error("podsToDelete contains an empty or duplicate pod name")]
    InvalidPodsToDelete,

    #[error("action is immutable: {old} -> {new}")]
    ActionChanged {
        old: DeployAction,
        new: DeployAction,
    },

    #[error("changes on a finished deployflow are not allowed")]
    Finished,
}

impl ValidationError {
    /// Rejections caused by the object's lifecycle rather than its shape
    pub fn is_conflict(&self) -> bool {
        matches!(self, ValidationError::Finished)
    }
}

/// Validate a DeployFlow spec in isolation
///
/// Shared by the admission webhook, the REST front end and the reconcile
/// loop, which refuses to act on a spec that slipped past admission.
///
/// # Rules
/// - the strategy present must match the Action (update strategy for
///   update/rollback, non-update strategy otherwise)
/// - `clonesetName` is required, replicas are non-negative, scale actions
///   name a target replica count
/// - batch size is a positive integer or a 1%..100% percentage
/// - batches and batch interval are non-negative
/// - canary lies within 0..=replicas and stage is a forward phase
pub fn validate_spec(spec: &DeployFlowSpec) -> Result<(), ValidationError> {
    let action = spec.action;

    ActionStrategy::resolve(spec)?;

    let application = &spec.application;
    if application.cloneset_name.trim().is_empty() {
        return Err(ValidationError::MissingCloneSetName);
    }
    if let Some(replicas) = application.replicas {
        if replicas < 0 {
            return Err(ValidationError::NegativeReplicas(replicas));
        }
    } else if action.is_scale() {
        return Err(ValidationError::MissingReplicas(action));
    }

    if let Some(strategy) = &spec.update_strategy {
        validate_base(&strategy.base)?;

        let replicas = application.replicas.unwrap_or(0);
        if strategy.canary < 0 || (application.replicas.is_some() && strategy.canary > replicas)
        {
            return Err(ValidationError::InvalidCanary {
                canary: strategy.canary,
                replicas,
            });
        }
        if let Some(stage) = strategy.stage {
            if stage.is_failed() {
                return Err(ValidationError::InvalidStage(stage));
            }
        }
    }

    if let Some(strategy) = &spec.non_update_strategy {
        validate_base(&strategy.base)?;

        if let Some(pods) = &strategy.pods_to_delete {
            let mut seen = std::collections::BTreeSet::new();
            if pods.iter().any(|p| p.is_empty() || !seen.insert(p.as_str())) {
                return Err(ValidationError::InvalidPodsToDelete);
            }
        }
    }

    Ok(())
}

fn validate_base(base: &BaseStrategy) -> Result<(), ValidationError> {
    if let Some(size) = &base.batch_size {
        if !is_valid_batch_size(size) {
            let raw = match size {
                IntOrString::Int(n) => n.to_string(),
                IntOrString::String(s) => s.clone(),
            };
            return Err(ValidationError::InvalidBatchSize(raw));
        }
    }
    if let Some(batches) = base.batches {
        if batches < 0 {
            return Err(ValidationError::InvalidBatches(batches));
        }
    }
    if base.batch_interval_seconds < 0 {
        return Err(ValidationError::NegativeInterval(base.batch_interval_seconds));
    }
    Ok(())
}

/// Absolute sizes must be positive; strings are "N" or "N%" with 1 <= N <= 100
pub fn is_valid_batch_size(size: &IntOrString) -> bool {
    match size {
        IntOrString::Int(n) => *n > 0,
        IntOrString::String(s) => match s.strip_suffix('%') {
            Some(pct) => pct.parse::<i32>().is_ok_and(|p| (1..=100).contains(&p)),
            None => s.parse::<i32>().is_ok_and(|n| n > 0),
        },
    }
}

/// Validate an update of an existing DeployFlow
///
/// The new spec must be valid on its own, the Action cannot change, and a
/// finished rollout accepts no further spec changes.
pub fn validate_update(old: &DeployFlow, new: &DeployFlow) -> Result<(), ValidationError> {
    if old.spec.action != new.spec.action {
        return Err(ValidationError::ActionChanged {
            old: old.spec.action,
            new: new.spec.action,
        });
    }

    let finished = old.status.as_ref().is_some_and(|s| s.finished);
    if finished && serde_json::to_value(&old.spec).ok() != serde_json::to_value(&new.spec).ok() {
        return Err(ValidationError::Finished);
    }

    validate_spec(&new.spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::deployflow::{
        ApplicationSpec, DeployFlowStatus, DeployNonUpdateStrategy, DeployUpdateStrategy,
    };

    fn spec(action: DeployAction) -> DeployFlowSpec {
        DeployFlowSpec {
            action,
            application: ApplicationSpec {
                cloneset_name: "web".to_string(),
                replicas: Some(10),
                ..Default::default()
            },
            update_strategy: None,
            non_update_strategy: None,
        }
    }

    fn update_spec(strategy: DeployUpdateStrategy) -> DeployFlowSpec {
        DeployFlowSpec {
            update_strategy: Some(strategy),
            ..spec(DeployAction::Update)
        }
    }

    #[test]
    fn test_valid_update_spec() {
        let s = update_spec(DeployUpdateStrategy {
            base: BaseStrategy {
                batch_size: Some(IntOrString::String("30%".to_string())),
                batches: Some(3),
                ..Default::default()
            },
            canary: 1,
            stage: Some(BatchPhase::Smoked),
            ..Default::default()
        });
        assert_eq!(validate_spec(&s), Ok(()));
    }

    #[test]
    fn test_absent_strategy_is_allowed() {
        assert_eq!(validate_spec(&spec(DeployAction::Update)), Ok(()));
        assert_eq!(validate_spec(&spec(DeployAction::Restart)), Ok(()));
    }

    #[test]
    fn test_update_action_rejects_non_update_strategy() {
        let s = DeployFlowSpec {
            non_update_strategy: Some(DeployNonUpdateStrategy::default()),
            ..spec(DeployAction::Rollback)
        };
        assert!(matches!(
            validate_spec(&s),
            Err(ValidationError::StrategyMismatch {
                expected: "updateStrategy",
                ..
            })
        ));
    }

    #[test]
    fn test_restart_action_rejects_update_strategy() {
        let s = DeployFlowSpec {
            update_strategy: Some(DeployUpdateStrategy::default()),
            ..spec(DeployAction::Restart)
        };
        assert!(matches!(
            validate_spec(&s),
            Err(ValidationError::StrategyMismatch { .. })
        ));
    }

    #[test]
    fn test_batch_size_rules() {
        assert!(is_valid_batch_size(&IntOrString::Int(1)));
        assert!(is_valid_batch_size(&IntOrString::String("5".to_string())));
        assert!(is_valid_batch_size(&IntOrString::String("100%".to_string())));
        assert!(!is_valid_batch_size(&IntOrString::Int(0)));
        assert!(!is_valid_batch_size(&IntOrString::String("0%".to_string())));
        assert!(!is_valid_batch_size(&IntOrString::String("150%".to_string())));
        assert!(!is_valid_batch_size(&IntOrString::String("abc".to_string())));
    }

    #[test]
    fn test_canary_larger_than_replicas_rejected() {
        let s = update_spec(DeployUpdateStrategy {
            canary: 11,
            ..Default::default()
        });
        assert_eq!(
            validate_spec(&s),
            Err(ValidationError::InvalidCanary {
                canary: 11,
                replicas: 10
            })
        );
    }

    #[test]
    fn test_failure_stage_rejected() {
        let s = update_spec(DeployUpdateStrategy {
            stage: Some(BatchPhase::BakeFailed),
            ..Default::default()
        });
        assert_eq!(
            validate_spec(&s),
            Err(ValidationError::InvalidStage(BatchPhase::BakeFailed))
        );
    }

    #[test]
    fn test_negative_batches_and_interval_rejected() {
        let s = update_spec(DeployUpdateStrategy {
            base: BaseStrategy {
                batches: Some(-1),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(validate_spec(&s), Err(ValidationError::InvalidBatches(-1)));

        let s = update_spec(DeployUpdateStrategy {
            base: BaseStrategy {
                batch_interval_seconds: -5,
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(validate_spec(&s), Err(ValidationError::NegativeInterval(-5)));
    }

    #[test]
    fn test_scale_requires_replicas() {
        let mut s = spec(DeployAction::Scale);
        s.application.replicas = None;
        assert_eq!(
            validate_spec(&s),
            Err(ValidationError::MissingReplicas(DeployAction::Scale))
        );
    }

    #[test]
    fn test_duplicate_pods_to_delete_rejected() {
        let s = DeployFlowSpec {
            non_update_strategy: Some(DeployNonUpdateStrategy {
                pods_to_delete: Some(vec!["a".to_string(), "a".to_string()]),
                ..Default::default()
            }),
            ..spec(DeployAction::Restart)
        };
        assert_eq!(validate_spec(&s), Err(ValidationError::InvalidPodsToDelete));
    }

    #[test]
    fn test_update_cannot_change_action() {
        let old = DeployFlow::new("web", spec(DeployAction::Update));
        let new = DeployFlow::new("web", spec(DeployAction::Restart));
        assert!(matches!(
            validate_update(&old, &new),
            Err(ValidationError::ActionChanged { .. })
        ));
    }

    #[test]
    fn test_finished_flow_rejects_strategy_change_as_conflict() {
        let mut old = DeployFlow::new("web", spec(DeployAction::Update));
        old.status = Some(DeployFlowStatus {
            finished: true,
            ..Default::default()
        });
        let new = DeployFlow::new(
            "web",
            update_spec(DeployUpdateStrategy {
                base: BaseStrategy {
                    paused: Some(true),
                    ..Default::default()
                },
                ..Default::default()
            }),
        );

        let err = validate_update(&old, &new).unwrap_err();
        assert_eq!(err, ValidationError::Finished);
        assert!(err.is_conflict());

        // Unchanged spec (e.g. a metadata-only update) passes
        let same = DeployFlow::new("web", spec(DeployAction::Update));
        assert_eq!(validate_update(&old, &same), Ok(()));
    }
}
