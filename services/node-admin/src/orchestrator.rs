//! Orchestrator client.
//!
//! The orchestrator arbitrates whether nodes may be taken out of service
//! without violating cluster-wide availability constraints. A denial is a
//! policy decision, not a transport failure - callers branch on the two.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::engine::CallLog;
use crate::spec::HostName;

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The orchestrator refused the operation on availability grounds.
    #[error("denied by orchestrator: {0}")]
    Denied(String),

    /// The request could not be completed.
    #[error("orchestrator request failed: {0}")]
    Transport(String),
}

/// Orchestrator interface.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Ask permission to take one node out of service.
    async fn suspend_node(&self, hostname: &HostName) -> Result<(), OrchestratorError>;

    /// Report one node back in service.
    async fn resume_node(&self, hostname: &HostName) -> Result<(), OrchestratorError>;

    /// Ask permission to suspend every node under a parent host.
    async fn suspend_hosts(
        &self,
        parent: &HostName,
        hostnames: &[HostName],
    ) -> Result<(), OrchestratorError>;

    /// Report a parent host's nodes back in service.
    async fn resume_hosts(
        &self,
        parent: &HostName,
        hostnames: &[HostName],
    ) -> Result<(), OrchestratorError>;
}

// =============================================================================
// HTTP client
// =============================================================================

/// HTTP client for the orchestrator API.
pub struct OrchestratorClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    hostnames: &'a [HostName],
}

impl OrchestratorClient {
    pub fn new(config: &Config) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.orchestrator_url.clone(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<(), OrchestratorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::CONFLICT {
            Err(OrchestratorError::Denied(body))
        } else {
            Err(OrchestratorError::Transport(format!("{status} - {body}")))
        }
    }
}

#[async_trait]
impl Orchestrator for OrchestratorClient {
    async fn suspend_node(&self, hostname: &HostName) -> Result<(), OrchestratorError> {
        let url = format!("{}/v1/suspensions/hosts/{}", self.base_url, hostname);
        debug!(hostname = %hostname, "Requesting node suspension");

        let response = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn resume_node(&self, hostname: &HostName) -> Result<(), OrchestratorError> {
        let url = format!("{}/v1/suspensions/hosts/{}", self.base_url, hostname);
        debug!(hostname = %hostname, "Resuming node");

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn suspend_hosts(
        &self,
        parent: &HostName,
        hostnames: &[HostName],
    ) -> Result<(), OrchestratorError> {
        let url = format!("{}/v1/suspensions/parents/{}", self.base_url, parent);
        debug!(parent = %parent, count = hostnames.len(), "Requesting host suspension");

        let response = self
            .client
            .put(&url)
            .json(&BatchRequest { hostnames })
            .send()
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn resume_hosts(
        &self,
        parent: &HostName,
        hostnames: &[HostName],
    ) -> Result<(), OrchestratorError> {
        let url = format!("{}/v1/resumptions/parents/{}", self.base_url, parent);
        debug!(parent = %parent, count = hostnames.len(), "Resuming hosts");

        let response = self
            .client
            .put(&url)
            .json(&BatchRequest { hostnames })
            .send()
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;
        Self::check(response).await
    }
}

// =============================================================================
// Mock
// =============================================================================

/// Mock orchestrator with an allow/deny toggle.
pub struct MockOrchestrator {
    allow_suspend: Mutex<bool>,
    log: CallLog,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::with_log(CallLog::new())
    }

    pub fn with_log(log: CallLog) -> Self {
        Self {
            allow_suspend: Mutex::new(true),
            log,
        }
    }

    pub fn set_allow_suspend(&self, allow: bool) {
        *self.allow_suspend.lock().unwrap() = allow;
    }

    fn check_allowed(&self) -> Result<(), OrchestratorError> {
        if *self.allow_suspend.lock().unwrap() {
            Ok(())
        } else {
            Err(OrchestratorError::Denied(
                "suspension would violate availability constraints".to_string(),
            ))
        }
    }
}

impl Default for MockOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn suspend_node(&self, hostname: &HostName) -> Result<(), OrchestratorError> {
        self.log.record(format!("orchestrator-suspend {hostname}"));
        self.check_allowed()
    }

    async fn resume_node(&self, hostname: &HostName) -> Result<(), OrchestratorError> {
        self.log.record(format!("orchestrator-resume {hostname}"));
        Ok(())
    }

    async fn suspend_hosts(
        &self,
        parent: &HostName,
        hostnames: &[HostName],
    ) -> Result<(), OrchestratorError> {
        self.log.record(format!(
            "orchestrator-suspend-hosts {} [{}]",
            parent,
            join_hostnames(hostnames)
        ));
        self.check_allowed()
    }

    async fn resume_hosts(
        &self,
        parent: &HostName,
        hostnames: &[HostName],
    ) -> Result<(), OrchestratorError> {
        self.log.record(format!(
            "orchestrator-resume-hosts {} [{}]",
            parent,
            join_hostnames(hostnames)
        ));
        Ok(())
    }
}

fn join_hostnames(hostnames: &[HostName]) -> String {
    hostnames
        .iter()
        .map(|h| h.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
