//! Lease-based leader election
//!
//! Replicas compete for a `coordination.k8s.io/v1` Lease. Every write carries
//! the `resourceVersion` that was read, so two replicas racing for an expired
//! lease cannot both win: the loser gets a 409 and stays a follower.
//!
//! Non-leaders keep serving health, webhook and REST traffic; only the
//! reconcile loop checks [`LeaderState`].

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::shutdown::ShutdownSignal;

pub const DEFAULT_LEASE_NAME: &str = "triton-controller-leader";
pub const DEFAULT_LEASE_NAMESPACE: &str = "triton-system";
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Whether this replica currently holds the lease
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    leader: Arc<AtomicBool>,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        let was = self.leader.swap(leader, Ordering::SeqCst);
        if was != leader {
            info!(leader, "Leadership changed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub holder_id: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i32,
    pub renew_interval: Duration,
}

impl LeaderConfig {
    /// Identity from `POD_NAME`, then `HOSTNAME`, then a random `triton-<uuid>`
    pub fn from_env() -> Self {
        let holder_id = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("triton-{}", uuid::Uuid::new_v4()));
        let lease_namespace = std::env::var("POD_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_LEASE_NAMESPACE.to_string());

        Self {
            holder_id,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace,
            lease_duration_seconds: DEFAULT_LEASE_TTL.as_secs() as i32,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// A lease is expired once `now` is strictly past `renewTime + duration`
///
/// A lease missing either field is up for grabs.
pub fn is_lease_expired(
    renew_time: Option<&MicroTime>,
    lease_duration_seconds: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    match (renew_time, lease_duration_seconds) {
        (Some(renewed), Some(duration)) => {
            now > renewed.0 + chrono::Duration::seconds(i64::from(duration))
        }
        _ => true,
    }
}

/// What to do with the lease as last read
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseDecision {
    Create,
    Renew,
    /// Expired lease held by someone else; take it with this transition count
    TakeOver { transitions: i32 },
    /// Someone else holds a live lease
    Follow,
}

pub fn decide(lease: Option<&Lease>, holder_id: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(holder_id) {
        return LeaseDecision::Renew;
    }
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    if is_lease_expired(renew_time, duration, now) {
        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseDecision::TakeOver {
            transitions: transitions + 1,
        }
    } else {
        LeaseDecision::Follow
    }
}

/// Lease body written on create, renew and takeover
pub fn lease_for(
    config: &LeaderConfig,
    existing: Option<&Lease>,
    now: DateTime<Utc>,
    transitions: i32,
) -> Lease {
    let mut metadata = existing.map(|l| l.metadata.clone()).unwrap_or(ObjectMeta {
        name: Some(config.lease_name.clone()),
        namespace: Some(config.lease_namespace.clone()),
        ..Default::default()
    });
    metadata.managed_fields = None;

    let acquire_time = existing
        .and_then(|l| l.spec.as_ref())
        .filter(|s| s.holder_identity.as_deref() == Some(config.holder_id.as_str()))
        .and_then(|s| s.acquire_time.clone())
        .unwrap_or(MicroTime(now));

    Lease {
        metadata,
        spec: Some(LeaseSpec {
            holder_identity: Some(config.holder_id.clone()),
            lease_duration_seconds: Some(config.lease_duration_seconds),
            acquire_time: Some(acquire_time),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }),
    }
}

/// One acquire-or-renew round; `Ok(true)` while this replica holds the lease
pub async fn try_acquire_or_renew(
    api: &Api<Lease>,
    config: &LeaderConfig,
) -> Result<bool, LeaderElectionError> {
    let now = Utc::now();
    let existing = match api.get(&config.lease_name).await {
        Ok(lease) => Some(lease),
        Err(kube::Error::Api(e)) if e.code == 404 => None,
        Err(e) => return Err(e.into()),
    };

    let decision = decide(existing.as_ref(), &config.holder_id, now);
    let lease = match (&decision, existing.as_ref()) {
        (LeaseDecision::Follow, _) => return Ok(false),
        (LeaseDecision::Create, _) | (_, None) => lease_for(config, None, now, 0),
        (LeaseDecision::Renew, Some(current)) => {
            let transitions = current
                .spec
                .as_ref()
                .and_then(|s| s.lease_transitions)
                .unwrap_or(0);
            lease_for(config, Some(current), now, transitions)
        }
        (LeaseDecision::TakeOver { transitions }, Some(current)) => {
            lease_for(config, Some(current), now, *transitions)
        }
    };

    let result = match existing {
        None => api.create(&PostParams::default(), &lease).await,
        Some(current) => {
            if current.metadata.resource_version.is_none() {
                return Err(LeaderElectionError::MissingResourceVersion(
                    config.lease_name.clone(),
                ));
            }
            api.replace(&config.lease_name, &PostParams::default(), &lease)
                .await
        }
    };

    match result {
        Ok(_) => {
            if let LeaseDecision::TakeOver { transitions } = decision {
                info!(holder = %config.holder_id, transitions, "Took over expired lease");
            } else {
                debug!(holder = %config.holder_id, ?decision, "Lease held");
            }
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(holder = %config.holder_id, "Lease changed since read, staying follower");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Drop the holder so a standby can take over without waiting for expiry
async fn release(api: &Api<Lease>, config: &LeaderConfig) -> Result<(), LeaderElectionError> {
    let mut lease = match api.get(&config.lease_name).await {
        Ok(lease) => lease,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let held = lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        == Some(config.holder_id.as_str());
    if !held {
        return Ok(());
    }
    if let Some(spec) = lease.spec.as_mut() {
        spec.holder_identity = None;
        spec.renew_time = None;
    }
    lease.metadata.managed_fields = None;
    api.replace(&config.lease_name, &PostParams::default(), &lease)
        .await?;
    info!(holder = %config.holder_id, "Lease released");
    Ok(())
}

/// Compete for the lease until shutdown, mirroring the result into `state`
///
/// API errors demote this replica: a leader that cannot renew must assume
/// someone else will take over once the lease expires.
pub async fn run_leader_election(
    client: Client,
    config: LeaderConfig,
    state: LeaderState,
    mut shutdown: ShutdownSignal,
) {
    let api: Api<Lease> = Api::namespaced(client, &config.lease_namespace);
    info!(
        holder = %config.holder_id,
        lease = %config.lease_name,
        namespace = %config.lease_namespace,
        "Starting leader election"
    );

    loop {
        match try_acquire_or_renew(&api, &config).await {
            Ok(leader) => state.set_leader(leader),
            Err(e) => {
                warn!(holder = %config.holder_id, error = %e, "Lease round failed");
                state.set_leader(false);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.renew_interval) => {}
            _ = shutdown.wait() => break,
        }
    }

    if state.is_leader() {
        state.set_leader(false);
        if let Err(e) = release(&api, &config).await {
            warn!(holder = %config.holder_id, error = %e, "Failed to release lease");
        }
    }
}
