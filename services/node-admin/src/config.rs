//! Configuration for the node admin.

use std::time::Duration;

use anyhow::Result;
use hostfleet_reconcile::{DEFAULT_GC_GRACE, DEFAULT_RECONCILE_INTERVAL};

use crate::spec::HostName;

/// Node admin configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname of the host this admin runs on (parent of all managed nodes).
    pub base_hostname: HostName,

    /// Node repository API URL.
    pub node_repository_url: String,

    /// Orchestrator API URL.
    pub orchestrator_url: String,

    /// Interval between desired-state polls.
    pub reconcile_interval: Duration,

    /// How long an image must stay unused before it is deleted.
    pub image_gc_grace: Duration,

    /// Path of the node-control program inside workload containers.
    pub node_ctl_path: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let base_hostname = std::env::var("FLEET_BASE_HOSTNAME")
            .map(|s| HostName::new(s))
            .unwrap_or_else(|_| HostName::new("localhost"));

        let node_repository_url = std::env::var("FLEET_NODE_REPOSITORY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let orchestrator_url = std::env::var("FLEET_ORCHESTRATOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8081".to_string());

        let reconcile_interval = std::env::var("FLEET_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL);

        let image_gc_grace = std::env::var("FLEET_IMAGE_GC_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_GC_GRACE);

        let node_ctl_path = std::env::var("FLEET_NODE_CTL_PATH")
            .unwrap_or_else(|_| "/opt/hostfleet/bin/node-ctl".to_string());

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            base_hostname,
            node_repository_url,
            orchestrator_url,
            reconcile_interval,
            image_gc_grace,
            node_ctl_path,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.image_gc_grace, Duration::from_secs(15 * 60));
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert!(config.node_ctl_path.ends_with("node-ctl"));
    }
}
