//! REST front end for DeployFlows
//!
//! Routes under `/api/v1`:
//! - `GET    /namespaces/{ns}/deployflows` list (`clonesetName`, `start`, `pageSize`)
//! - `GET    /namespaces/{ns}/deployflows/{name}`
//! - `POST   /namespaces/{ns}/deployflows` create
//! - `PATCH  /namespaces/{ns}/deployflows/{name}` replace the strategy
//! - `DELETE /namespaces/{ns}/deployflows/{name}`
//! - `POST   /namespaces/{ns}/instances/{cloneset}/rollbacks`
//! - `POST   /namespaces/{ns}/instances/{cloneset}/restarts`
//! - `POST   /namespaces/{ns}/instances/{cloneset}/scales`
//!
//! Every write goes through the same validation as the admission webhook.
//! The reconcile loop picks created or patched DeployFlows up from its watch.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::shutdown::ShutdownSignal;
use crate::controller::deployflow::{validate_spec, validate_update, ValidationError};
use crate::crd::cloneset::CloneSet;
use crate::crd::deployflow::{
    ApplicationSpec, BatchCondition, DeployAction, DeployFlow, DeployFlowSpec, DeployFlowStatus,
    DeployNonUpdateStrategy, DeployUpdateStrategy,
};

pub const DEFAULT_PAGE_SIZE: usize = 10;

/// CloneSet labels copied into `application` for restarts and scales
pub const APP_ID_LABEL: &str = "apps.triton.io/app-id";
pub const GROUP_ID_LABEL: &str = "apps.triton.io/group-id";
pub const APP_NAME_LABEL: &str = "apps.triton.io/app-name";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) if resp.code == 409 => ApiError::Conflict(resp.message),
            kube::Error::Api(resp) if resp.code == 404 => ApiError::NotFound(resp.message),
            other => ApiError::Kube(other),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Invalid(e) if e.is_conflict() => StatusCode::CONFLICT,
            ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::Kube(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "REST request failed");
        }
        let body = json!({ "code": status.as_u16(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Storage seam for the REST handlers
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn list(&self, namespace: &str) -> Result<Vec<DeployFlow>, ApiError>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DeployFlow>, ApiError>;
    async fn create(&self, flow: &DeployFlow) -> Result<DeployFlow, ApiError>;
    /// Replace guarded by the object's resourceVersion
    async fn replace(&self, flow: &DeployFlow) -> Result<DeployFlow, ApiError>;
    /// `Ok(false)` when nothing was there to delete
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ApiError>;
    async fn get_cloneset(&self, namespace: &str, name: &str)
        -> Result<Option<CloneSet>, ApiError>;
}

pub struct KubeFlowStore {
    client: Client,
}

impl KubeFlowStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn flows(&self, namespace: &str) -> Api<DeployFlow> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl FlowStore for KubeFlowStore {
    async fn list(&self, namespace: &str) -> Result<Vec<DeployFlow>, ApiError> {
        Ok(self.flows(namespace).list(&ListParams::default()).await?.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DeployFlow>, ApiError> {
        Ok(self.flows(namespace).get_opt(name).await?)
    }

    async fn create(&self, flow: &DeployFlow) -> Result<DeployFlow, ApiError> {
        let namespace = flow.namespace().unwrap_or_default();
        Ok(self
            .flows(&namespace)
            .create(&PostParams::default(), flow)
            .await?)
    }

    async fn replace(&self, flow: &DeployFlow) -> Result<DeployFlow, ApiError> {
        let namespace = flow.namespace().unwrap_or_default();
        Ok(self
            .flows(&namespace)
            .replace(&flow.name_any(), &PostParams::default(), flow)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ApiError> {
        match self
            .flows(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_cloneset(&self, namespace: &str, name: &str) -> Result<Option<CloneSet>, ApiError> {
        Ok(Api::<CloneSet>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?)
    }
}

/// Reply for every single-object route
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FlowReply {
    pub name: String,
    pub namespace: String,
    pub action: DeployAction,
    #[serde(rename = "clonesetName")]
    pub cloneset_name: String,
    pub status: DeployFlowStatus,
    #[serde(rename = "currentBatch")]
    pub current_batch: Option<BatchCondition>,
}

impl From<&DeployFlow> for FlowReply {
    fn from(flow: &DeployFlow) -> Self {
        let status = flow.status.clone().unwrap_or_default();
        Self {
            name: flow.name_any(),
            namespace: flow.namespace().unwrap_or_default(),
            action: flow.spec.action,
            cloneset_name: flow.spec.application.cloneset_name.clone(),
            current_batch: status.current_batch().cloned(),
            status,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    #[serde(rename = "clonesetName")]
    pub cloneset_name: Option<String>,
    pub start: Option<usize>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    /// Generated from the CloneSet and Action when absent
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub spec: DeployFlowSpec,
}

#[derive(Debug, Deserialize, Default)]
pub struct RollbackRequest {
    /// DeployFlow whose template to restore; defaults to the last good
    /// revision before the current one
    #[serde(rename = "deployName", default)]
    pub deploy_name: Option<String>,
    #[serde(rename = "updateStrategy", default)]
    pub update_strategy: Option<DeployUpdateStrategy>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ScaleRequest {
    pub replicas: i32,
    #[serde(rename = "nonUpdateStrategy", default)]
    pub non_update_strategy: Option<DeployNonUpdateStrategy>,
}

#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn FlowStore>,
}

impl ApiState {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Empty bodies fall back to the request's defaults
fn decode_optional<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        decode(body)
    }
}

fn created_order(flows: &mut [DeployFlow]) {
    flows.sort_by(|a, b| {
        b.creation_timestamp()
            .cmp(&a.creation_timestamp())
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
}

/// Newest first, filtered by CloneSet, then paged
pub fn page(mut flows: Vec<DeployFlow>, query: &ListQuery) -> Vec<DeployFlow> {
    if let Some(cloneset) = query.cloneset_name.as_deref().filter(|s| !s.is_empty()) {
        flows.retain(|f| f.spec.application.cloneset_name == cloneset);
    }
    created_order(&mut flows);
    let size = match query.page_size {
        None | Some(0) => DEFAULT_PAGE_SIZE,
        Some(n) => n,
    };
    flows
        .into_iter()
        .skip(query.start.unwrap_or(0))
        .take(size)
        .collect()
}

fn generated_name(cloneset: &str, action: DeployAction) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        cloneset,
        action.as_str().to_ascii_lowercase(),
        &suffix[..8]
    )
}

fn is_unfinished(flow: &DeployFlow) -> bool {
    !flow.status.as_ref().is_some_and(|s| s.finished)
}

async fn require_cloneset(
    store: &dyn FlowStore,
    namespace: &str,
    name: &str,
) -> Result<CloneSet, ApiError> {
    store
        .get_cloneset(namespace, name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cloneset {}/{}", namespace, name)))
}

async fn require_flow(
    store: &dyn FlowStore,
    namespace: &str,
    name: &str,
) -> Result<DeployFlow, ApiError> {
    store
        .get(namespace, name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("deployflow {}/{}", namespace, name)))
}

/// Validate and store a new DeployFlow
///
/// Only one unfinished rollout may drive a CloneSet at a time.
async fn submit(
    store: &dyn FlowStore,
    namespace: &str,
    name: Option<String>,
    spec: DeployFlowSpec,
) -> Result<DeployFlow, ApiError> {
    validate_spec(&spec)?;

    let cloneset = spec.application.cloneset_name.clone();
    let running = store
        .list(namespace)
        .await?
        .into_iter()
        .find(|f| f.spec.application.cloneset_name == cloneset && is_unfinished(f));
    if let Some(running) = running {
        return Err(ApiError::Conflict(format!(
            "cloneset {} already has an unfinished deployflow {}",
            cloneset,
            running.name_any()
        )));
    }

    let name = name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| generated_name(&cloneset, spec.action));
    let mut flow = DeployFlow::new(&name, spec);
    flow.metadata.namespace = Some(namespace.to_string());

    let created = store.create(&flow).await?;
    info!(
        namespace,
        deployflow = %name,
        cloneset = %cloneset,
        action = %created.spec.action,
        "Created deployflow"
    );
    Ok(created)
}

/// Application spec describing the CloneSet as it runs now
pub fn application_from_cloneset(cs: &CloneSet) -> ApplicationSpec {
    let labels = cs.labels();
    let id = |key: &str| labels.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
    ApplicationSpec {
        app_id: id(APP_ID_LABEL),
        group_id: id(GROUP_ID_LABEL),
        app_name: labels
            .get(APP_NAME_LABEL)
            .cloned()
            .unwrap_or_else(|| cs.name_any()),
        cloneset_name: cs.name_any(),
        selector: Some(cs.spec.selector.clone()),
        template: cs.spec.template.clone(),
        replicas: Some(cs.desired_replicas()),
        application_type: Some("cloneset".to_string()),
        volume_claim_templates: cs.spec.volume_claim_templates.clone(),
        application_label: (!labels.is_empty()).then(|| labels.clone()),
    }
}

/// Revision to restore when no rollback target is named
///
/// If the newest revision change succeeded it is what runs now, so the
/// target is the successful one before it. Otherwise the newest successful
/// change is still running and is the target.
fn previous_revision<'a>(flows: &'a mut [DeployFlow], cloneset: &str) -> Option<&'a DeployFlow> {
    created_order(flows);
    let succeeded = |f: &DeployFlow| {
        f.status
            .as_ref()
            .is_some_and(|s| s.phase == crate::crd::deployflow::DeployPhase::Success)
    };
    let mut changes = flows
        .iter()
        .filter(|f| f.spec.application.cloneset_name == cloneset)
        .filter(|f| f.spec.action.revision_changed());

    // Either way the target is the newest success older than the newest change
    changes.next()?;
    changes.find(|f| succeeded(f))
}

async fn list_flows(
    State(state): State<ApiState>,
    Path(namespace): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<FlowReply>>, ApiError> {
    let flows = state.store.list(&namespace).await?;
    let replies = page(flows, &query).iter().map(FlowReply::from).collect();
    Ok(Json(replies))
}

async fn get_flow(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<FlowReply>, ApiError> {
    let flow = require_flow(state.store.as_ref(), &namespace, &name).await?;
    Ok(Json(FlowReply::from(&flow)))
}

async fn create_flow(
    State(state): State<ApiState>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<FlowReply>), ApiError> {
    let request: CreateRequest = decode(&body)?;
    let created = submit(state.store.as_ref(), &namespace, request.name, request.spec).await?;
    Ok((StatusCode::CREATED, Json(FlowReply::from(&created))))
}

/// Replace the strategy of a running rollout
///
/// The body is an update strategy for update/rollback flows and a non-update
/// strategy for everything else.
async fn patch_strategy(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<FlowReply>, ApiError> {
    let current = require_flow(state.store.as_ref(), &namespace, &name).await?;
    if current.status.as_ref().is_some_and(|s| s.finished) {
        return Err(ValidationError::Finished.into());
    }

    let mut patched = current.clone();
    if current.spec.action.revision_changed() {
        patched.spec.update_strategy = Some(decode::<DeployUpdateStrategy>(&body)?);
    } else {
        patched.spec.non_update_strategy = Some(decode::<DeployNonUpdateStrategy>(&body)?);
    }
    validate_update(&current, &patched)?;

    let stored = state.store.replace(&patched).await?;
    info!(namespace = %namespace, deployflow = %name, "Patched deployflow strategy");
    Ok(Json(FlowReply::from(&stored)))
}

async fn delete_flow(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete(&namespace, &name).await? {
        info!(namespace = %namespace, deployflow = %name, "Deleted deployflow");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn create_rollback(
    State(state): State<ApiState>,
    Path((namespace, cloneset_name)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<FlowReply>), ApiError> {
    let request: RollbackRequest = decode_optional(&body)?;
    let store = state.store.as_ref();
    let cloneset = require_cloneset(store, &namespace, &cloneset_name).await?;

    let target = match request.deploy_name.filter(|n| !n.is_empty()) {
        Some(name) => {
            let flow = require_flow(store, &namespace, &name).await?;
            if flow.spec.application.cloneset_name != cloneset_name
                || !flow.spec.action.revision_changed()
            {
                return Err(ApiError::BadRequest(format!(
                    "deployflow {} did not roll out a revision of cloneset {}",
                    name, cloneset_name
                )));
            }
            flow
        }
        None => {
            let mut flows = store.list(&namespace).await?;
            previous_revision(&mut flows, &cloneset_name)
                .cloned()
                .ok_or_else(|| {
                    ApiError::NotFound(format!("previous revision of cloneset {}", cloneset_name))
                })?
        }
    };

    let mut application = target.spec.application.clone();
    application.replicas = Some(cloneset.desired_replicas());
    let spec = DeployFlowSpec {
        action: DeployAction::Rollback,
        application,
        update_strategy: request.update_strategy,
        non_update_strategy: None,
    };

    let created = submit(store, &namespace, None, spec).await?;
    info!(
        namespace = %namespace,
        cloneset = %cloneset_name,
        from = %target.name_any(),
        "Rollback requested"
    );
    Ok((StatusCode::CREATED, Json(FlowReply::from(&created))))
}

async fn create_restart(
    State(state): State<ApiState>,
    Path((namespace, cloneset_name)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<FlowReply>), ApiError> {
    let strategy: Option<DeployNonUpdateStrategy> = decode_optional(&body)?;
    let store = state.store.as_ref();
    let cloneset = require_cloneset(store, &namespace, &cloneset_name).await?;

    let spec = DeployFlowSpec {
        action: DeployAction::Restart,
        application: application_from_cloneset(&cloneset),
        update_strategy: None,
        non_update_strategy: strategy,
    };
    let created = submit(store, &namespace, None, spec).await?;
    Ok((StatusCode::CREATED, Json(FlowReply::from(&created))))
}

async fn create_scale(
    State(state): State<ApiState>,
    Path((namespace, cloneset_name)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<FlowReply>), ApiError> {
    let request: ScaleRequest = decode(&body)?;
    let store = state.store.as_ref();
    let cloneset = require_cloneset(store, &namespace, &cloneset_name).await?;

    let mut application = application_from_cloneset(&cloneset);
    application.replicas = Some(request.replicas);
    let spec = DeployFlowSpec {
        action: DeployAction::Scale,
        application,
        update_strategy: None,
        non_update_strategy: request.non_update_strategy,
    };
    let created = submit(store, &namespace, None, spec).await?;
    Ok((StatusCode::CREATED, Json(FlowReply::from(&created))))
}

pub fn api_router(store: Arc<dyn FlowStore>) -> Router {
    let routes = Router::new()
        .route(
            "/namespaces/{namespace}/deployflows",
            get(list_flows).post(create_flow),
        )
        .route(
            "/namespaces/{namespace}/deployflows/{name}",
            get(get_flow).patch(patch_strategy).delete(delete_flow),
        )
        .route(
            "/namespaces/{namespace}/instances/{name}/rollbacks",
            post(create_rollback),
        )
        .route(
            "/namespaces/{namespace}/instances/{name}/restarts",
            post(create_restart),
        )
        .route(
            "/namespaces/{namespace}/instances/{name}/scales",
            post(create_scale),
        )
        .with_state(ApiState::new(store));
    Router::new().nest("/api/v1", routes)
}

pub async fn run_api_server(
    port: u16,
    store: Arc<dyn FlowStore>,
    shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port, "REST API listening");

    axum::serve(listener, api_router(store))
        .with_graceful_shutdown(shutdown.stopped())
        .await
}

/// In-memory store standing in for the apiserver
#[cfg(test)]
pub struct MemoryFlowStore {
    flows: std::sync::Mutex<std::collections::BTreeMap<(String, String), DeployFlow>>,
    clonesets: std::sync::Mutex<std::collections::BTreeMap<(String, String), CloneSet>>,
    clock: std::sync::atomic::AtomicI64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MemoryFlowStore {
    pub fn new() -> Self {
        Self {
            flows: Default::default(),
            clonesets: Default::default(),
            clock: std::sync::atomic::AtomicI64::new(1_775_000_000),
        }
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    pub fn add_cloneset(&self, cs: CloneSet) {
        let key = Self::key(&cs.namespace().unwrap_or_default(), &cs.name_any());
        self.clonesets.lock().unwrap().insert(key, cs);
    }

    /// Store a flow as-is, stamping metadata the apiserver would set
    pub fn insert(&self, mut flow: DeployFlow) {
        self.stamp(&mut flow);
        let key = Self::key(&flow.namespace().unwrap_or_default(), &flow.name_any());
        self.flows.lock().unwrap().insert(key, flow);
    }

    pub fn flow(&self, namespace: &str, name: &str) -> Option<DeployFlow> {
        self.flows
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.flows.lock().unwrap().len()
    }

    fn stamp(&self, flow: &mut DeployFlow) {
        let secs = self
            .clock
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let meta = &mut flow.metadata;
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = chrono::DateTime::from_timestamp(secs, 0)
                .map(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time);
        }
        meta.resource_version = Some(secs.to_string());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn list(&self, namespace: &str) -> Result<Vec<DeployFlow>, ApiError> {
        Ok(self
            .flows
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, f)| f.clone())
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DeployFlow>, ApiError> {
        Ok(self.flow(namespace, name))
    }

    async fn create(&self, flow: &DeployFlow) -> Result<DeployFlow, ApiError> {
        let key = Self::key(&flow.namespace().unwrap_or_default(), &flow.name_any());
        if self.flows.lock().unwrap().contains_key(&key) {
            return Err(ApiError::Conflict(format!(
                "deployflow {} already exists",
                key.1
            )));
        }
        let mut stored = flow.clone();
        self.stamp(&mut stored);
        self.flows.lock().unwrap().insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, flow: &DeployFlow) -> Result<DeployFlow, ApiError> {
        let key = Self::key(&flow.namespace().unwrap_or_default(), &flow.name_any());
        let mut flows = self.flows.lock().unwrap();
        let Some(current) = flows.get(&key) else {
            return Err(ApiError::NotFound(format!("deployflow {}", key.1)));
        };
        if current.metadata.resource_version != flow.metadata.resource_version {
            return Err(ApiError::Conflict("the object has been modified".to_string()));
        }
        let mut stored = flow.clone();
        self.stamp(&mut stored);
        flows.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ApiError> {
        Ok(self
            .flows
            .lock()
            .unwrap()
            .remove(&Self::key(namespace, name))
            .is_some())
    }

    async fn get_cloneset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CloneSet>, ApiError> {
        Ok(self
            .clonesets
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned())
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
