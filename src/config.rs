//! Controller configuration from environment variables
//!
//! Every setting has a default. Values that fail to parse fall back to the
//! default with a warning instead of aborting startup.

use crate::controller::deployflow::ProgressionTimings;
use std::time::Duration;
use tracing::warn;

/// Runtime configuration of the controller process
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// TRITON_BAKE_SECONDS
    pub bake_seconds: u64,
    /// TRITON_BAKE_FAILURE_GRACE_SECONDS
    pub bake_failure_grace_seconds: u64,
    /// TRITON_SMOKE_TIMEOUT_SECONDS, 0 disables
    pub smoke_timeout_seconds: u64,
    /// TRITON_FAILED_BATCH_TIMEOUT_SECONDS, 0 waits forever
    pub failed_batch_timeout_seconds: u64,
    /// TRITON_RESYNC_SECONDS
    pub resync: Duration,
    /// TRITON_CONCURRENCY
    pub concurrency: u16,
    /// TRITON_NAMESPACE_SCOPE; unset watches all namespaces
    pub namespace_scope: Option<String>,
    /// TRITON_LEADER_ELECTION
    pub leader_election: bool,
    /// TRITON_HEALTH_PORT
    pub health_port: u16,
    /// TRITON_REST_PORT
    pub rest_port: u16,
    /// TRITON_WEBHOOK_TLS
    pub webhook_tls: bool,
    /// TRITON_SERVICE_NAME, used for webhook certificate SANs
    pub service_name: String,
    /// TRITON_NAMESPACE, where the controller itself runs
    pub namespace: String,
}

pub const DEFAULT_BAKE_SECONDS: u64 = 60;
pub const DEFAULT_SMOKE_TIMEOUT_SECONDS: u64 = 600;
pub const DEFAULT_FAILED_BATCH_TIMEOUT_SECONDS: u64 = 1800;
pub const DEFAULT_RESYNC_SECONDS: u64 = 30;
pub const DEFAULT_CONCURRENCY: u16 = 4;
pub const DEFAULT_HEALTH_PORT: u16 = 8000;
pub const DEFAULT_REST_PORT: u16 = 8088;
pub const WEBHOOK_TLS_PORT: u16 = 9443;

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bake_seconds: DEFAULT_BAKE_SECONDS,
            bake_failure_grace_seconds: 0,
            smoke_timeout_seconds: DEFAULT_SMOKE_TIMEOUT_SECONDS,
            failed_batch_timeout_seconds: DEFAULT_FAILED_BATCH_TIMEOUT_SECONDS,
            resync: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            concurrency: DEFAULT_CONCURRENCY,
            namespace_scope: None,
            leader_election: false,
            health_port: DEFAULT_HEALTH_PORT,
            rest_port: DEFAULT_REST_PORT,
            webhook_tls: false,
            service_name: "triton-controller".to_string(),
            namespace: "triton-system".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let resync_seconds: u64 = parse_or(&lookup, "TRITON_RESYNC_SECONDS", DEFAULT_RESYNC_SECONDS);

        Self {
            bake_seconds: parse_or(&lookup, "TRITON_BAKE_SECONDS", defaults.bake_seconds),
            bake_failure_grace_seconds: parse_or(
                &lookup,
                "TRITON_BAKE_FAILURE_GRACE_SECONDS",
                defaults.bake_failure_grace_seconds,
            ),
            smoke_timeout_seconds: parse_or(
                &lookup,
                "TRITON_SMOKE_TIMEOUT_SECONDS",
                defaults.smoke_timeout_seconds,
            ),
            failed_batch_timeout_seconds: parse_or(
                &lookup,
                "TRITON_FAILED_BATCH_TIMEOUT_SECONDS",
                defaults.failed_batch_timeout_seconds,
            ),
            resync: Duration::from_secs(resync_seconds.max(1)),
            concurrency: parse_or(&lookup, "TRITON_CONCURRENCY", defaults.concurrency).max(1),
            namespace_scope: lookup("TRITON_NAMESPACE_SCOPE").filter(|s| !s.is_empty()),
            leader_election: parse_bool(&lookup, "TRITON_LEADER_ELECTION", false),
            health_port: parse_or(&lookup, "TRITON_HEALTH_PORT", defaults.health_port),
            rest_port: parse_or(&lookup, "TRITON_REST_PORT", defaults.rest_port),
            webhook_tls: parse_bool(&lookup, "TRITON_WEBHOOK_TLS", false),
            service_name: lookup("TRITON_SERVICE_NAME")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.service_name),
            namespace: lookup("TRITON_NAMESPACE")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.namespace),
        }
    }

    pub fn timings(&self) -> ProgressionTimings {
        // Anything past a few decades is as good as forever
        let seconds = |s: u64| chrono::Duration::seconds(s.min(1_000_000_000) as i64);
        let optional = |s: u64| (s > 0).then(|| seconds(s));
        ProgressionTimings {
            bake: seconds(self.bake_seconds),
            bake_failure_grace: seconds(self.bake_failure_grace_seconds),
            smoke_timeout: optional(self.smoke_timeout_seconds),
            failed_batch_timeout: optional(self.failed_batch_timeout_seconds),
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = key, value = %raw, "Invalid value, using default");
                default
            }
        },
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") => default,
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(other) => {
            warn!(variable = key, value = other, "Invalid boolean, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ControllerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ControllerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let cfg = config(&[]);
        assert_eq!(cfg, ControllerConfig::default());
        assert_eq!(cfg.timings(), ProgressionTimings::default());
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("TRITON_BAKE_SECONDS", "5"),
            ("TRITON_CONCURRENCY", "8"),
            ("TRITON_NAMESPACE_SCOPE", "apps"),
            ("TRITON_LEADER_ELECTION", "true"),
            ("TRITON_SMOKE_TIMEOUT_SECONDS", "0"),
        ]);
        assert_eq!(cfg.bake_seconds, 5);
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.namespace_scope.as_deref(), Some("apps"));
        assert!(cfg.leader_election);
        assert_eq!(cfg.timings().bake, chrono::Duration::seconds(5));
        assert_eq!(cfg.timings().smoke_timeout, None);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config(&[
            ("TRITON_BAKE_SECONDS", "soon"),
            ("TRITON_HEALTH_PORT", "99999"),
            ("TRITON_WEBHOOK_TLS", "maybe"),
            ("TRITON_CONCURRENCY", "0"),
        ]);
        assert_eq!(cfg.bake_seconds, DEFAULT_BAKE_SECONDS);
        assert_eq!(cfg.health_port, DEFAULT_HEALTH_PORT);
        assert!(!cfg.webhook_tls);
        assert_eq!(cfg.concurrency, 1);
    }
}
