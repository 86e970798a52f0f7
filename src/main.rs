use kube::Client;
use std::sync::Arc;
use triton::config::{ControllerConfig, WEBHOOK_TLS_PORT};
use triton::controller::{run_controllers, Context};
use triton::server::{
    build_rustls_config, create_metrics, initialize_tls, run_api_server, run_health_server,
    run_health_server_tls, run_leader_election, shutdown_channel, wait_for_signal, KubeFlowStore,
    LeaderConfig, LeaderState, ReadinessState, DEFAULT_TLS_SECRET_NAME,
    DEFAULT_WEBHOOK_CONFIG_NAME,
};
use tracing::{error, info, warn};

/// Port and scheme of the probe/webhook server
///
/// The apiserver only calls admission webhooks over HTTPS, so enabling
/// webhook TLS moves the whole server to the webhook port.
fn probe_listener(config: &ControllerConfig) -> (u16, &'static str) {
    if config.webhook_tls {
        (WEBHOOK_TLS_PORT, "HTTPS")
    } else {
        (config.health_port, "HTTP")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting triton DeployFlow controller");

    // kube and the webhook server share one rustls provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = ControllerConfig::from_env();
    info!(?config, "Loaded configuration");

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;
    let leader_state = LeaderState::new();

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let tls_config = if config.webhook_tls {
        info!(
            service = %config.service_name,
            namespace = %config.namespace,
            "Initializing webhook TLS certificates"
        );
        let bundle = initialize_tls(
            &client,
            &config.service_name,
            &config.namespace,
            DEFAULT_TLS_SECRET_NAME,
            DEFAULT_WEBHOOK_CONFIG_NAME,
        )
        .await
        .inspect_err(|e| error!(error = %e, "Failed to initialize TLS certificates"))?;
        let tls = build_rustls_config(&bundle)
            .inspect_err(|e| error!(error = %e, "Failed to build TLS config"))?;
        info!("Webhook TLS initialized");
        Some(tls)
    } else {
        info!("Webhook TLS disabled, serving HTTP only");
        None
    };

    let (probe_port, probe_mode) = probe_listener(&config);
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_shutdown = shutdown_signal.clone();
    let health_handle = tokio::spawn(async move {
        let result = match tls_config {
            Some(tls) => {
                run_health_server_tls(
                    probe_port,
                    health_readiness,
                    health_metrics,
                    tls,
                    health_shutdown,
                )
                .await
            }
            None => {
                run_health_server(probe_port, health_readiness, health_metrics, health_shutdown)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(error = %e, mode = probe_mode, "Health server failed");
        }
    });

    let rest_port = config.rest_port;
    let store = Arc::new(KubeFlowStore::new(client.clone()));
    let rest_shutdown = shutdown_signal.clone();
    let rest_handle = tokio::spawn(async move {
        if let Err(e) = run_api_server(rest_port, store, rest_shutdown).await {
            warn!(error = %e, "REST API server failed");
        }
    });

    let leader_handle = if config.leader_election {
        let leader_config = LeaderConfig::from_env();
        info!(
            holder_id = %leader_config.holder_id,
            lease = %leader_config.lease_name,
            "Leader election enabled"
        );
        Some(tokio::spawn(run_leader_election(
            client.clone(),
            leader_config,
            leader_state.clone(),
            shutdown_signal.clone(),
        )))
    } else {
        info!("Leader election disabled, running as single instance");
        leader_state.set_leader(true);
        None
    };

    let ctx = if config.leader_election {
        Arc::new(Context::new_with_leader(
            client.clone(),
            config,
            leader_state.clone(),
            Some(metrics.clone()),
        ))
    } else {
        Arc::new(Context::new(client.clone(), config, Some(metrics.clone())))
    };

    // Readiness means initialized, not leading: followers stay in rotation
    readiness.set_ready();
    info!("Controller ready, starting reconciliation");

    tokio::select! {
        _ = run_controllers(client, ctx) => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();
    info!("Stopping components");

    // The leader task releases its Lease on the way out
    if let Some(handle) = leader_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Leader election task failed");
        }
    }
    for handle in [rest_handle, health_handle] {
        if let Err(e) = handle.await {
            warn!(error = %e, "Server task failed");
        }
    }

    info!("triton controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
