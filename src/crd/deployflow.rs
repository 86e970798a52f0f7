use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// DeployFlow describes one progressive rollout of a CloneSet-backed application
///
/// `spec` carries the target application state plus the strategy for the
/// current Action; the status is written only by the controller.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "apps.triton.io",
    version = "v1alpha1",
    kind = "DeployFlow",
    namespaced,
    shortname = "df",
    status = "DeployFlowStatus",
    printcolumn = r#"{"name":"REPLICAS", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"UPDATED_READY_REPLICAS", "type":"integer", "jsonPath":".status.updatedReadyReplicas"}"#,
    printcolumn = r#"{"name":"FINISHED_REPLICAS", "type":"integer", "jsonPath":".status.finishedReplicas"}"#,
    printcolumn = r#"{"name":"PHASE", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"BATCHES", "type":"integer", "jsonPath":".status.batches"}"#,
    printcolumn = r#"{"name":"CURRENT_BATCH_SIZE", "type":"integer", "jsonPath":".status.conditions[-1].batchSize"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"UPDATE_AT", "type":"date", "priority":1, "jsonPath":".status.updatedAt"}"#,
    printcolumn = r#"{"name":"PODS", "type":"string", "priority":1, "jsonPath":".status.pods"}"#
)]
pub struct DeployFlowSpec {
    /// What this rollout does to the application; immutable once set
    pub action: DeployAction,

    /// Convergence target for the underlying CloneSet
    pub application: ApplicationSpec,

    /// Strategy for revision-changing actions (update, rollback)
    #[serde(rename = "updateStrategy", skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<DeployUpdateStrategy>,

    /// Strategy for every other action (create, restart, scale*)
    #[serde(rename = "nonUpdateStrategy", skip_serializing_if = "Option::is_none")]
    pub non_update_strategy: Option<DeployNonUpdateStrategy>,
}

/// Action vocabulary of a DeployFlow
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum DeployAction {
    Create,
    Update,
    Restart,
    Scale,
    ScaleIn,
    ScaleOut,
    Rollback,
}

impl DeployAction {
    /// `update` and `rollback` roll out a new pod template revision
    pub fn revision_changed(&self) -> bool {
        matches!(self, DeployAction::Update | DeployAction::Rollback)
    }

    pub fn is_scale(&self) -> bool {
        matches!(
            self,
            DeployAction::Scale | DeployAction::ScaleIn | DeployAction::ScaleOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployAction::Create => "create",
            DeployAction::Update => "update",
            DeployAction::Restart => "restart",
            DeployAction::Scale => "scale",
            DeployAction::ScaleIn => "scaleIn",
            DeployAction::ScaleOut => "scaleOut",
            DeployAction::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for DeployAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target application state
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ApplicationSpec {
    #[serde(rename = "appID", default)]
    pub app_id: i64,

    #[serde(rename = "groupID", default)]
    pub group_id: i64,

    #[serde(rename = "appName", default)]
    pub app_name: String,

    /// Name of the CloneSet this rollout drives
    #[serde(rename = "clonesetName")]
    pub cloneset_name: String,

    /// Label query selecting the application's pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Pod template rolled out by update/rollback and used by create
    pub template: PodTemplateSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Workload flavour, e.g. "cloneset"
    #[serde(rename = "applicationType", skip_serializing_if = "Option::is_none")]
    pub application_type: Option<String>,

    #[serde(
        rename = "volumeClaimTemplates",
        skip_serializing_if = "Option::is_none"
    )]
    pub volume_claim_templates: Option<Vec<PersistentVolumeClaim>>,

    #[serde(rename = "applicationLabel", skip_serializing_if = "Option::is_none")]
    pub application_label: Option<BTreeMap<String, String>>,
}

/// Fields shared by update and non-update strategies
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BaseStrategy {
    /// true pauses the rollout, false resumes it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,

    #[serde(default)]
    pub canceled: bool,

    /// Pods per batch, absolute ("5") or percentage of the replicas to process ("10%")
    #[serde(rename = "batchSize", skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<IntOrString>,

    /// Minimum seconds between the start of two consecutive batches
    #[serde(rename = "batchIntervalSeconds", default)]
    pub batch_interval_seconds: i32,

    /// Defaults to manual for update strategies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeployMode>,

    /// Number of batches; unset or zero means one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batches: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DeployUpdateStrategy {
    #[serde(flatten)]
    pub base: BaseStrategy,

    /// Skip traffic pull-in; pods take traffic as soon as they are ready
    #[serde(rename = "noPullIn", default)]
    pub no_pull_in: bool,

    /// Size of the canary batch, 0 for none
    #[serde(default)]
    pub canary: i32,

    /// Furthest batch phase the operator allows in manual mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<BatchPhase>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DeployNonUpdateStrategy {
    #[serde(flatten)]
    pub base: BaseStrategy,

    /// Explicit pods to restart or remove, in order
    #[serde(rename = "podsToDelete", skip_serializing_if = "Option::is_none")]
    pub pods_to_delete: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    Auto,
    Manual,
}

/// Overall rollout phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DeployPhase {
    #[default]
    Pending,
    Initializing,
    BatchStarted,
    BatchFinished,
    Success,
    Failed,
    Aborted,
    Canceled,
}

impl DeployPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeployPhase::Success | DeployPhase::Failed | DeployPhase::Aborted | DeployPhase::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::Pending => "Pending",
            DeployPhase::Initializing => "Initializing",
            DeployPhase::BatchStarted => "BatchStarted",
            DeployPhase::BatchFinished => "BatchFinished",
            DeployPhase::Success => "Success",
            DeployPhase::Failed => "Failed",
            DeployPhase::Aborted => "Aborted",
            DeployPhase::Canceled => "Canceled",
        }
    }
}

/// Per-batch sub-phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum BatchPhase {
    #[default]
    Pending,
    Smoking,
    Smoked,
    Baking,
    Baked,
    SmokeFailed,
    BakeFailed,
}

impl BatchPhase {
    /// Position along Pending < Smoking < Smoked < Baking < Baked
    ///
    /// Failure phases sit outside the forward order.
    pub fn rank(&self) -> Option<u8> {
        match self {
            BatchPhase::Pending => Some(0),
            BatchPhase::Smoking => Some(1),
            BatchPhase::Smoked => Some(2),
            BatchPhase::Baking => Some(3),
            BatchPhase::Baked => Some(4),
            BatchPhase::SmokeFailed | BatchPhase::BakeFailed => None,
        }
    }

    /// Size and canary flag are frozen once a batch gets here
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchPhase::Baked | BatchPhase::SmokeFailed | BatchPhase::BakeFailed
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BatchPhase::SmokeFailed | BatchPhase::BakeFailed)
    }

    /// Traffic has been admitted to the batch
    pub fn is_pulled_in(&self) -> bool {
        matches!(
            self,
            BatchPhase::Baking | BatchPhase::Baked | BatchPhase::BakeFailed
        )
    }
}

/// Observed state of a DeployFlow
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DeployFlowStatus {
    /// Pods owned by the CloneSet
    #[serde(default)]
    pub replicas: i32,

    /// Pods created, restarted or removed by this rollout
    #[serde(rename = "replicasToProcess", default)]
    pub replicas_to_process: i32,

    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,

    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,

    #[serde(rename = "updatedReadyReplicas", default)]
    pub updated_ready_replicas: i32,

    #[serde(rename = "updateRevision", skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,

    /// One record per planned batch, in order
    #[serde(default)]
    pub conditions: Vec<BatchCondition>,

    /// Pods assigned to any batch
    #[serde(default)]
    pub pods: Vec<String>,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub phase: DeployPhase,

    #[serde(default)]
    pub finished: bool,

    #[serde(default)]
    pub batches: i32,

    #[serde(rename = "finishedBatches", default)]
    pub finished_batches: i32,

    #[serde(rename = "finishedReplicas", default)]
    pub finished_replicas: i32,

    #[serde(rename = "failedReplicas", default)]
    pub failed_replicas: i32,

    /// CloneSet replicas when a scale rollout started
    #[serde(rename = "baselineReplicas", skip_serializing_if = "Option::is_none")]
    pub baseline_replicas: Option<i32>,

    /// Why the rollout is halted, if it is
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,

    #[serde(rename = "finishedAt", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl DeployFlowStatus {
    /// The batch most recently planned or dispatched
    pub fn current_batch(&self) -> Option<&BatchCondition> {
        self.conditions.last()
    }
}

/// Record of a single batch
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BatchCondition {
    /// 1-based position
    pub batch: i32,

    #[serde(rename = "batchSize")]
    pub batch_size: i32,

    #[serde(default)]
    pub canary: bool,

    #[serde(default)]
    pub phase: BatchPhase,

    #[serde(rename = "failedReplicas", default)]
    pub failed_replicas: i32,

    #[serde(default)]
    pub pods: Vec<PodInfo>,

    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(rename = "pulledInAt", skip_serializing_if = "Option::is_none")]
    pub pulled_in_at: Option<String>,

    /// When the batch entered its current failure phase
    #[serde(rename = "failedAt", skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,

    #[serde(rename = "finishedAt", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

/// Pod summary, rebuilt from observation every pass
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodInfo {
    pub name: String,

    #[serde(default)]
    pub ip: String,

    #[serde(default)]
    pub port: i32,

    #[serde(default)]
    pub phase: String,

    #[serde(rename = "pullInStatus", default)]
    pub pull_in_status: String,
}

#[cfg(test)]
#[path = "deployflow_test.rs"]
mod tests;
