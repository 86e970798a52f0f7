//! Controller registry
//!
//! Static list of the controllers this process can run, keyed by the
//! resource kind each one needs. At startup the list is checked against API
//! discovery once; entries whose kind is not installed are skipped.

use super::deployflow::actuator::DEPLOYFLOW_ANNOTATION;
use super::deployflow::{error_policy, reconcile, Context};
use crate::crd::cloneset::CloneSet;
use crate::crd::deployflow::DeployFlow;
use futures::StreamExt;
use kube::api::Api;
use kube::discovery::Discovery;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a registry entry starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launcher {
    /// The DeployFlow reconcile loop
    DeployFlows,
    /// Re-trigger the owning DeployFlow when its CloneSet changes
    CloneSetTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub group: &'static str,
    pub kind: &'static str,
    pub launcher: Launcher,
}

pub const REGISTRY: &[Registration] = &[
    Registration {
        group: "apps.triton.io",
        kind: "DeployFlow",
        launcher: Launcher::DeployFlows,
    },
    Registration {
        group: "apps.kruise.io",
        kind: "CloneSet",
        launcher: Launcher::CloneSetTrigger,
    },
];

/// Entries whose kind passes `installed`, in registry order
pub fn enabled<'a>(
    registry: &'a [Registration],
    installed: impl Fn(&str, &str) -> bool,
) -> Vec<&'a Registration> {
    registry
        .iter()
        .filter(|r| {
            let present = installed(r.group, r.kind);
            if !present {
                info!(group = r.group, kind = r.kind, "Kind not installed, skipping controller");
            }
            present
        })
        .collect()
}

/// (group, kind) pairs served by the apiserver
pub async fn installed_kinds(client: &Client) -> Result<BTreeSet<(String, String)>, kube::Error> {
    let discovery = Discovery::new(client.clone()).run().await?;
    let mut kinds = BTreeSet::new();
    for group in discovery.groups() {
        for (resource, _caps) in group.recommended_resources() {
            kinds.insert((resource.group.clone(), resource.kind.clone()));
        }
    }
    Ok(kinds)
}

/// DeployFlow named by a CloneSet's annotation
pub fn flow_for_cloneset(cloneset: &CloneSet) -> Option<ObjectRef<DeployFlow>> {
    let flow = cloneset.annotations().get(DEPLOYFLOW_ANNOTATION)?;
    let namespace = cloneset.meta().namespace.as_deref()?;
    Some(ObjectRef::new(flow).within(namespace))
}

fn scoped_api<K>(client: Client, scope: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match scope {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Run every enabled controller until the stream ends
///
/// If discovery itself fails every entry is assumed present; the watches
/// then report the real problem.
pub async fn run_controllers(client: Client, ctx: Arc<Context>) {
    let installed = match installed_kinds(&client).await {
        Ok(kinds) => Some(kinds),
        Err(e) => {
            warn!(error = %e, "API discovery failed, starting every controller");
            None
        }
    };
    let enabled = enabled(REGISTRY, |group, kind| {
        installed
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&(group.to_string(), kind.to_string())))
    });
    let has = |launcher| enabled.iter().any(|r| r.launcher == launcher);

    if !has(Launcher::DeployFlows) {
        warn!("DeployFlow CRD not installed, nothing to reconcile");
        return;
    }

    let scope = ctx.config.namespace_scope.clone();
    let flows: Api<DeployFlow> = scoped_api(client.clone(), scope.as_deref());
    let mut deployflows = Controller::new(flows, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(ctx.config.concurrency));

    if has(Launcher::CloneSetTrigger) {
        let clonesets: Api<CloneSet> = scoped_api(client.clone(), scope.as_deref());
        deployflows = deployflows.watches(clonesets, watcher::Config::default(), |cs| {
            flow_for_cloneset(&cs)
        });
        info!("Watching CloneSets for DeployFlow triggers");
    } else {
        info!("CloneSet kind missing, relying on periodic requeues");
    }

    info!(
        concurrency = ctx.config.concurrency,
        namespace = scope.as_deref().unwrap_or("*"),
        "Starting DeployFlow controller"
    );

    deployflows
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok((obj, _)) = res {
                debug!(deployflow = %obj.name, "Reconciled");
            }
            // Errors are logged in error_policy
        })
        .await;
}
