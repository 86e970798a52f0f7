//! Typed view of the OpenKruise CloneSet
//!
//! Only the fields the rollout engine reads or writes are modelled. The
//! CloneSet controller owns pod lifecycle; we only steer it through
//! `replicas`, `updateStrategy.partition` and `scaleStrategy.podsToDelete`.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pod label carrying the CloneSet revision a pod was created from
pub const REVISION_LABEL: &str = "controller-revision-hash";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "apps.kruise.io",
    version = "v1alpha1",
    kind = "CloneSet",
    namespaced,
    status = "CloneSetStatus",
    derive = "PartialEq"
)]
pub struct CloneSetSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    pub selector: LabelSelector,

    pub template: PodTemplateSpec,

    #[serde(
        rename = "volumeClaimTemplates",
        skip_serializing_if = "Option::is_none"
    )]
    pub volume_claim_templates: Option<Vec<PersistentVolumeClaim>>,

    #[serde(rename = "scaleStrategy", skip_serializing_if = "Option::is_none")]
    pub scale_strategy: Option<CloneSetScaleStrategy>,

    #[serde(rename = "updateStrategy", skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<CloneSetUpdateStrategy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CloneSetScaleStrategy {
    /// Pods the CloneSet controller deletes first; with unchanged replicas
    /// they are recreated, which is how restarts are driven
    #[serde(rename = "podsToDelete", skip_serializing_if = "Option::is_none")]
    pub pods_to_delete: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CloneSetUpdateStrategy {
    /// Number of pods kept at the old revision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<IntOrString>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CloneSetStatus {
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub replicas: i32,

    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,

    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,

    #[serde(rename = "updatedReadyReplicas", default)]
    pub updated_ready_replicas: i32,

    #[serde(rename = "updateRevision", skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,

    #[serde(rename = "currentRevision", skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
}

impl CloneSet {
    pub fn desired_replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    /// Absolute partition; percentages resolve against desired replicas, rounding up
    pub fn partition(&self) -> Option<i32> {
        let partition = self.spec.update_strategy.as_ref()?.partition.as_ref()?;
        match partition {
            IntOrString::Int(n) => Some(*n),
            IntOrString::String(s) => {
                let pct: i64 = s.trim_end_matches('%').parse().ok()?;
                let replicas = i64::from(self.desired_replicas());
                Some(((replicas * pct + 99) / 100) as i32)
            }
        }
    }

    pub fn pods_to_delete(&self) -> &[String] {
        self.spec
            .scale_strategy
            .as_ref()
            .and_then(|s| s.pods_to_delete.as_deref())
            .unwrap_or_default()
    }

    pub fn update_revision(&self) -> Option<&str> {
        self.status.as_ref()?.update_revision.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloneset(replicas: i32, partition: Option<IntOrString>) -> CloneSet {
        CloneSet::new(
            "web",
            CloneSetSpec {
                replicas: Some(replicas),
                update_strategy: Some(CloneSetUpdateStrategy {
                    partition,
                    paused: None,
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_partition_absolute() {
        assert_eq!(cloneset(10, Some(IntOrString::Int(4))).partition(), Some(4));
    }

    #[test]
    fn test_partition_percentage_rounds_up() {
        let cs = cloneset(10, Some(IntOrString::String("25%".to_string())));
        assert_eq!(cs.partition(), Some(3));
    }

    #[test]
    fn test_partition_unset() {
        assert_eq!(cloneset(10, None).partition(), None);
    }

    #[test]
    fn test_pods_to_delete_defaults_to_empty() {
        assert!(cloneset(3, None).pods_to_delete().is_empty());
    }

    #[test]
    fn test_deserialize_kruise_status() {
        let json = serde_json::json!({
            "apiVersion": "apps.kruise.io/v1alpha1",
            "kind": "CloneSet",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicas": 5,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {"metadata": {"labels": {"app": "web"}}},
                "scaleStrategy": {"podsToDelete": ["web-a"]}
            },
            "status": {
                "replicas": 5,
                "readyReplicas": 4,
                "availableReplicas": 4,
                "updatedReplicas": 2,
                "updatedReadyReplicas": 2,
                "updateRevision": "web-7d9f",
                "currentRevision": "web-5c6b"
            }
        });

        let cs: CloneSet = serde_json::from_value(json).expect("valid CloneSet");
        assert_eq!(cs.desired_replicas(), 5);
        assert_eq!(cs.pods_to_delete(), ["web-a".to_string()]);
        assert_eq!(cs.update_revision(), Some("web-7d9f"));
        assert_eq!(cs.status.as_ref().map(|s| s.ready_replicas), Some(4));
    }
}
