//! Everything the controller serves or coordinates besides reconciliation
//!
//! - `/healthz`, `/readyz`, `/metrics` and the `/validate` admission webhook
//! - the `/api/v1` REST front end
//! - Lease-based leader election
//! - webhook certificate bootstrap
//! - graceful shutdown on SIGTERM/SIGINT

pub mod api;
mod health;
pub mod leader;
pub mod metrics;
pub mod shutdown;
pub mod tls;
pub mod webhook;

pub use api::{api_router, run_api_server, ApiError, FlowStore, KubeFlowStore};
pub use health::{build_router, run_health_server, run_health_server_tls, ReadinessState};
pub use leader::{run_leader_election, LeaderConfig, LeaderElectionError, LeaderState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};
pub use tls::{
    build_rustls_config, initialize_tls, CertificateBundle, TlsError, DEFAULT_TLS_SECRET_NAME,
    DEFAULT_WEBHOOK_CONFIG_NAME,
};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "leader_test.rs"]
mod leader_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;

#[cfg(test)]
#[path = "tls_test.rs"]
mod tls_tests;
