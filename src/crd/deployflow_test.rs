#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::*;
use kube::CustomResourceExt;

#[test]
fn test_update_flow_deserializes_with_inline_base_strategy() {
    let yaml = r#"
apiVersion: apps.triton.io/v1alpha1
kind: DeployFlow
metadata:
  name: web-update
  namespace: default
spec:
  action: update
  application:
    appID: 12122
    groupID: 10010
    appName: web
    clonesetName: 12122-web-10010-prod
    replicas: 100
    selector:
      matchLabels:
        app: web
    template:
      metadata:
        labels:
          app: web
      spec:
        containers:
        - name: web
          image: nginx:1.25
  updateStrategy:
    batchSize: 30
    batches: 4
    canary: 10
    mode: auto
    batchIntervalSeconds: 15
    noPullIn: true
    stage: Smoked
"#;

    let flow: DeployFlow = serde_yaml::from_str(yaml).expect("Failed to deserialize DeployFlow");

    assert_eq!(flow.spec.action, DeployAction::Update);
    assert_eq!(flow.spec.application.app_id, 12122);
    assert_eq!(flow.spec.application.cloneset_name, "12122-web-10010-prod");
    assert_eq!(flow.spec.application.replicas, Some(100));

    let strategy = flow.spec.update_strategy.expect("update strategy");
    assert_eq!(strategy.base.batch_size, Some(IntOrString::Int(30)));
    assert_eq!(strategy.base.batches, Some(4));
    assert_eq!(strategy.base.mode, Some(DeployMode::Auto));
    assert_eq!(strategy.base.batch_interval_seconds, 15);
    assert_eq!(strategy.canary, 10);
    assert!(strategy.no_pull_in);
    assert_eq!(strategy.stage, Some(BatchPhase::Smoked));
    assert!(flow.spec.non_update_strategy.is_none());
    assert!(flow.status.is_none());
}

#[test]
fn test_restart_flow_with_percentage_batch_size() {
    let yaml = r#"
apiVersion: apps.triton.io/v1alpha1
kind: DeployFlow
metadata:
  name: web-restart
spec:
  action: restart
  application:
    clonesetName: web
    template: {}
  nonUpdateStrategy:
    batchSize: "50%"
    paused: true
    podsToDelete: [web-a, web-b]
"#;

    let flow: DeployFlow = serde_yaml::from_str(yaml).unwrap();
    let strategy = flow.spec.non_update_strategy.unwrap();

    assert_eq!(flow.spec.action, DeployAction::Restart);
    assert_eq!(
        strategy.base.batch_size,
        Some(IntOrString::String("50%".to_string()))
    );
    assert_eq!(strategy.base.paused, Some(true));
    assert!(!strategy.base.canceled);
    assert_eq!(
        strategy.pods_to_delete,
        Some(vec!["web-a".to_string(), "web-b".to_string()])
    );
}

#[test]
fn test_action_wire_names() {
    let actions = [
        (DeployAction::Create, "create"),
        (DeployAction::ScaleIn, "scaleIn"),
        (DeployAction::ScaleOut, "scaleOut"),
        (DeployAction::Rollback, "rollback"),
    ];
    for (action, wire) in actions {
        assert_eq!(serde_json::to_value(action).unwrap(), serde_json::json!(wire));
        assert_eq!(action.as_str(), wire);
    }
}

#[test]
fn test_only_update_and_rollback_change_revision() {
    assert!(DeployAction::Update.revision_changed());
    assert!(DeployAction::Rollback.revision_changed());
    assert!(!DeployAction::Create.revision_changed());
    assert!(!DeployAction::Restart.revision_changed());
    assert!(!DeployAction::Scale.revision_changed());
}

#[test]
fn test_batch_phase_forward_order() {
    let order = [
        BatchPhase::Pending,
        BatchPhase::Smoking,
        BatchPhase::Smoked,
        BatchPhase::Baking,
        BatchPhase::Baked,
    ];
    for pair in order.windows(2) {
        assert!(pair[0].rank() < pair[1].rank());
    }
    assert_eq!(BatchPhase::SmokeFailed.rank(), None);
    assert!(BatchPhase::BakeFailed.is_terminal());
    assert!(!BatchPhase::Baking.is_terminal());
}

#[test]
fn test_terminal_deploy_phases() {
    assert!(DeployPhase::Success.is_terminal());
    assert!(DeployPhase::Canceled.is_terminal());
    assert!(!DeployPhase::BatchFinished.is_terminal());
    assert_eq!(DeployPhase::default(), DeployPhase::Pending);
}

#[test]
fn test_status_serializes_original_field_names() {
    let status = DeployFlowStatus {
        replicas_to_process: 3,
        conditions: vec![BatchCondition {
            batch: 1,
            batch_size: 3,
            phase: BatchPhase::Baking,
            pulled_in_at: Some("2026-01-01T00:00:00+00:00".to_string()),
            pods: vec![PodInfo {
                name: "web-a".to_string(),
                pull_in_status: "PulledIn".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["replicasToProcess"], 3);
    assert_eq!(json["phase"], "Pending");
    assert_eq!(json["conditions"][0]["batchSize"], 3);
    assert_eq!(json["conditions"][0]["phase"], "Baking");
    assert_eq!(json["conditions"][0]["pods"][0]["pullInStatus"], "PulledIn");
    assert!(json.get("finishedAt").is_none());
}

#[test]
fn test_current_batch_is_last_condition() {
    let status = DeployFlowStatus {
        conditions: vec![
            BatchCondition {
                batch: 1,
                batch_size: 1,
                ..Default::default()
            },
            BatchCondition {
                batch: 2,
                batch_size: 4,
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    assert_eq!(status.current_batch().map(|c| c.batch), Some(2));
    assert!(DeployFlowStatus::default().current_batch().is_none());
}

#[test]
fn test_crd_metadata() {
    let crd = DeployFlow::crd();
    assert_eq!(crd.spec.group, "apps.triton.io");
    assert_eq!(crd.spec.names.kind, "DeployFlow");
    assert_eq!(crd.spec.names.plural, "deployflows");
    assert_eq!(
        crd.spec.names.short_names,
        Some(vec!["df".to_string()])
    );

    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1alpha1");
    assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());

    let columns: Vec<&str> = version
        .additional_printer_columns
        .as_ref()
        .unwrap()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert!(columns.contains(&"PHASE"));
    assert!(columns.contains(&"CURRENT_BATCH_SIZE"));
}

#[test]
fn test_crd_schema_covers_kubernetes_types() {
    let crd = serde_json::to_value(DeployFlow::crd()).unwrap();
    let spec = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"];
    let application = &spec["properties"]["application"]["properties"];

    assert!(application["template"].is_object(), "pod template schema");
    assert!(application["selector"].is_object(), "label selector schema");
    assert!(spec["properties"]["updateStrategy"].is_object());
}
