//! Batch planning
//!
//! Pure functions turning (replicas, canary, batch size, batch count) into
//! ordered batch boundaries. No I/O, deterministic for identical inputs.

use crate::crd::deployflow::{BatchCondition, BatchPhase};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("batch size must be > 0, got {0}")]
    NonPositiveBatchSize(i32),

    #[error("invalid batch size {0:?}")]
    InvalidBatchSize(String),

    #[error("batch count must be > 0, got {0}")]
    NonPositiveBatches(i32),

    #[error("canary ({canary}) must be between 0 and replicas to process ({replicas})")]
    InvalidCanary { canary: i32, replicas: i32 },

    #[error("replicas to process must be >= 0, got {0}")]
    NegativeReplicas(i32),
}

/// One planned batch: replicas `[start, end)` of the rollout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    /// 1-based
    pub index: i32,
    pub start: i32,
    pub end: i32,
    pub canary: bool,
}

impl PlannedBatch {
    pub fn size(&self) -> i32 {
        self.end - self.start
    }
}

/// Resolve a batch size against the replicas to process
///
/// Percentages round up; "N" strings parse as absolute sizes.
pub fn resolve_batch_size(size: &IntOrString, total: i32) -> Result<i32, PlanError> {
    let resolved = match size {
        IntOrString::Int(n) => *n,
        IntOrString::String(s) => match s.strip_suffix('%') {
            Some(pct) => {
                let pct: i64 = pct
                    .trim()
                    .parse()
                    .map_err(|_| PlanError::InvalidBatchSize(s.clone()))?;
                let total = i64::from(total);
                i32::try_from((total * pct + 99) / 100)
                    .map_err(|_| PlanError::InvalidBatchSize(s.clone()))?
            }
            None => s
                .trim()
                .parse()
                .map_err(|_| PlanError::InvalidBatchSize(s.clone()))?,
        },
    };
    if resolved <= 0 {
        return Err(PlanError::NonPositiveBatchSize(resolved));
    }
    Ok(resolved)
}

/// Plan batches for a fresh rollout
///
/// With a canary, batch 1 holds exactly `canary` replicas and the rest are
/// split over `batches - 1` regular batches (at least one when replicas
/// remain). Each regular batch holds `batch_size` replicas except the last,
/// which absorbs the remainder. The regular batch count is capped so that no
/// batch is empty. An unset batch size splits the remainder evenly, rounding
/// up. Zero replicas plan zero batches.
pub fn plan_batches(
    total: i32,
    canary: i32,
    batch_size: Option<&IntOrString>,
    batches: i32,
) -> Result<Vec<PlannedBatch>, PlanError> {
    replan_batches(&[], total, canary, batch_size, batches)
}

/// Replan a rollout that may already be underway
///
/// Every batch that has left `Pending` is kept with its frozen size and
/// canary flag. The replicas not covered by kept batches are planned over
/// the remaining batch count; the canary only applies while nothing has
/// been dispatched. The batch size is resolved against the full plan, so an
/// unchanged strategy reproduces the original tail exactly.
pub fn replan_batches(
    existing: &[BatchCondition],
    total: i32,
    canary: i32,
    batch_size: Option<&IntOrString>,
    batches: i32,
) -> Result<Vec<PlannedBatch>, PlanError> {
    if total < 0 {
        return Err(PlanError::NegativeReplicas(total));
    }
    if batches <= 0 {
        return Err(PlanError::NonPositiveBatches(batches));
    }
    if canary < 0 || canary > total {
        return Err(PlanError::InvalidCanary {
            canary,
            replicas: total,
        });
    }

    // A percentage of zero replicas still has to be a usable size
    let size = match batch_size {
        Some(size) => Some(resolve_batch_size(size, total.max(1))?),
        None => None,
    };

    let regular_full = regular_batch_count(total - canary, canary > 0, batches);
    let size = match size {
        Some(size) => size,
        None if regular_full > 0 => div_ceil(total - canary, regular_full),
        None => 1,
    };

    let kept: Vec<&BatchCondition> = existing
        .iter()
        .take_while(|c| c.phase != BatchPhase::Pending)
        .collect();

    let mut plan: Vec<PlannedBatch> = Vec::with_capacity(batches as usize + 1);
    let mut cursor = 0;
    for condition in &kept {
        plan.push(PlannedBatch {
            index: plan.len() as i32 + 1,
            start: cursor,
            end: cursor + condition.batch_size,
            canary: condition.canary,
        });
        cursor += condition.batch_size;
    }

    let remaining = (total - cursor).max(0);
    if remaining == 0 {
        return Ok(plan);
    }

    let with_canary = kept.is_empty() && canary > 0;
    let remaining_batches = batches - kept.len() as i32;

    if with_canary {
        plan.push(PlannedBatch {
            index: 1,
            start: 0,
            end: canary,
            canary: true,
        });
        cursor = canary;
    }

    let rest = total - cursor;
    let regular = regular_batch_count(rest, with_canary, remaining_batches).min(div_ceil(rest, size));
    for i in 0..regular {
        let end = if i == regular - 1 { total } else { cursor + size };
        plan.push(PlannedBatch {
            index: plan.len() as i32 + 1,
            start: cursor,
            end,
            canary: false,
        });
        cursor = end;
    }

    Ok(plan)
}

/// Regular (non-canary) batches for `rest` replicas, never zero while replicas remain
fn regular_batch_count(rest: i32, with_canary: bool, batches: i32) -> i32 {
    if rest <= 0 {
        return 0;
    }
    let count = if with_canary { batches - 1 } else { batches };
    count.max(1)
}

fn div_ceil(a: i32, b: i32) -> i32 {
    (a + b - 1) / b
}

/// Build fresh `Pending` batch records for planned batches
pub fn pending_conditions(plan: &[PlannedBatch]) -> Vec<BatchCondition> {
    plan.iter()
        .map(|b| BatchCondition {
            batch: b.index,
            batch_size: b.size(),
            canary: b.canary,
            phase: BatchPhase::Pending,
            ..Default::default()
        })
        .collect()
}

/// Merge a plan into existing batch records
///
/// Dispatched records are kept untouched; the pending tail is replaced by
/// the planned tail. Returns `None` when the records already match the plan.
pub fn merge_plan(
    existing: &[BatchCondition],
    plan: &[PlannedBatch],
) -> Option<Vec<BatchCondition>> {
    let kept = existing
        .iter()
        .take_while(|c| c.phase != BatchPhase::Pending)
        .count();

    let tail_matches = existing.len() == plan.len()
        && existing[kept..]
            .iter()
            .zip(&plan[kept..])
            .all(|(c, p)| c.batch == p.index && c.batch_size == p.size() && c.canary == p.canary);
    if tail_matches {
        return None;
    }

    let mut merged: Vec<BatchCondition> = existing[..kept].to_vec();
    merged.extend(pending_conditions(&plan[kept.min(plan.len())..]));
    Some(merged)
}
