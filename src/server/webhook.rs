//! Validating admission webhook for DeployFlow
//!
//! The apiserver POSTs an `admission.k8s.io/v1` AdmissionReview to
//! `/validate` for every DeployFlow CREATE and UPDATE. The same checks the
//! REST front end runs decide the verdict:
//! - the strategy shape matches the Action
//! - batch size, canary and batch count are in range
//! - Action is immutable
//! - a finished rollout accepts no spec changes

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::controller::deployflow::{validate_spec, validate_update, ValidationError};
use crate::crd::deployflow::DeployFlow;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    /// CREATE, UPDATE, DELETE or CONNECT
    pub operation: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default)]
    pub old_object: Option<Value>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AdmissionStatus {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

impl AdmissionResponse {
    fn allow(uid: String) -> Self {
        Self {
            uid,
            allowed: true,
            status: None,
        }
    }

    fn deny(uid: String, code: u16, reason: &str, message: String) -> Self {
        Self {
            uid,
            allowed: false,
            status: Some(AdmissionStatus {
                code,
                reason: reason.to_string(),
                message,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

fn parse_flow(raw: Option<Value>, field: &str) -> Result<DeployFlow, String> {
    let raw = raw.ok_or_else(|| format!("request.{} is missing", field))?;
    serde_json::from_value(raw).map_err(|e| format!("request.{} is not a DeployFlow: {}", field, e))
}

fn rejection(uid: String, err: ValidationError) -> AdmissionResponse {
    if err.is_conflict() {
        AdmissionResponse::deny(uid, 409, "Conflict", err.to_string())
    } else {
        AdmissionResponse::deny(uid, 422, "Invalid", err.to_string())
    }
}

/// Verdict for one admission request
pub fn review(request: AdmissionRequest) -> AdmissionResponse {
    let uid = request.uid;
    match request.operation.as_str() {
        "CREATE" => match parse_flow(request.object, "object") {
            Ok(flow) => match validate_spec(&flow.spec) {
                Ok(()) => AdmissionResponse::allow(uid),
                Err(e) => rejection(uid, e),
            },
            Err(msg) => AdmissionResponse::deny(uid, 400, "BadRequest", msg),
        },
        "UPDATE" => {
            let old = parse_flow(request.old_object, "oldObject");
            let new = parse_flow(request.object, "object");
            match (old, new) {
                (Ok(old), Ok(new)) => match validate_update(&old, &new) {
                    Ok(()) => AdmissionResponse::allow(uid),
                    Err(e) => rejection(uid, e),
                },
                (Err(msg), _) | (_, Err(msg)) => {
                    AdmissionResponse::deny(uid, 400, "BadRequest", msg)
                }
            }
        }
        _ => AdmissionResponse::allow(uid),
    }
}

/// Axum handler for `/validate`
pub async fn handle_validate(Json(body): Json<AdmissionReview>) -> impl IntoResponse {
    let Some(request) = body.request else {
        warn!("AdmissionReview without request");
        return (
            StatusCode::BAD_REQUEST,
            "AdmissionReview.request is required".to_string(),
        )
            .into_response();
    };

    let namespace = request.namespace.clone().unwrap_or_default();
    let name = request.name.clone().unwrap_or_default();
    let operation = request.operation.clone();
    let response = review(request);

    match &response.status {
        None => info!(%namespace, deployflow = %name, %operation, "Admission allowed"),
        Some(status) => warn!(
            %namespace,
            deployflow = %name,
            %operation,
            reason = %status.message,
            "Admission denied"
        ),
    }

    let review = AdmissionReviewResponse {
        api_version: body.api_version,
        kind: body.kind,
        response,
    };
    (StatusCode::OK, Json(review)).into_response()
}

#[cfg(test)]
#[path = "webhook_test.rs"]
mod tests;
