//! Graceful shutdown
//!
//! `main` owns the [`ShutdownController`]; every background task (leader
//! election, REST and health servers) holds a [`ShutdownSignal`] clone and
//! stops once it fires.

use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is triggered or the controller is dropped
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|stopping| *stopping).await;
    }

    /// Owned variant for `with_graceful_shutdown`
    pub async fn stopped(mut self) {
        self.wait().await
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
        info!("Shutdown signal sent");
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Block until SIGTERM or SIGINT and return its name
///
/// If a handler cannot be installed the other one is still awaited; with
/// neither available this falls back to Ctrl+C.
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::error;

    let sigterm = signal(SignalKind::terminate())
        .inspect_err(|e| error!(error = %e, "Failed to register SIGTERM handler"))
        .ok();
    let sigint = signal(SignalKind::interrupt())
        .inspect_err(|e| error!(error = %e, "Failed to register SIGINT handler"))
        .ok();

    let name = match (sigterm, sigint) {
        (Some(mut term), Some(mut int)) => tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        },
        (Some(mut term), None) => {
            term.recv().await;
            "SIGTERM"
        }
        (None, Some(mut int)) => {
            int.recv().await;
            "SIGINT"
        }
        (None, None) => {
            let _ = tokio::signal::ctrl_c().await;
            "CTRL_C"
        }
    };
    info!(signal = name, "Received termination signal");
    name
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to wait for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C");
    "CTRL_C"
}
