//! Node repository client.
//!
//! The node repository is the remote source of truth for desired node
//! state. The admin polls it for the full spec list and publishes node
//! attributes back after convergence.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, error};

use crate::config::Config;
use crate::engine::CallLog;
use crate::spec::{ContainerNodeSpec, HostName, NodeAttributes};

/// Node repository interface.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Desired specs for every node managed by this host.
    async fn get_containers_to_run(&self) -> Result<Vec<ContainerNodeSpec>>;

    /// Report a node as cleaned up and ready for reallocation.
    async fn mark_node_as_ready(&self, hostname: &HostName) -> Result<()>;

    /// Publish a node's converged attributes.
    async fn update_node_attributes(
        &self,
        hostname: &HostName,
        attributes: &NodeAttributes,
    ) -> Result<()>;
}

// =============================================================================
// HTTP client
// =============================================================================

/// HTTP client for the node repository API.
pub struct NodeRepositoryClient {
    client: reqwest::Client,
    base_url: String,
    base_hostname: HostName,
}

/// Spec list response from the node repository.
#[derive(Debug, Deserialize)]
struct NodeListResponse {
    #[allow(dead_code)]
    generated_at: DateTime<Utc>,
    nodes: Vec<ContainerNodeSpec>,
}

impl NodeRepositoryClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.node_repository_url.clone(),
            base_hostname: config.base_hostname.clone(),
        })
    }
}

#[async_trait]
impl NodeRepository for NodeRepositoryClient {
    async fn get_containers_to_run(&self) -> Result<Vec<ContainerNodeSpec>> {
        let url = format!(
            "{}/v1/hosts/{}/nodes",
            self.base_url, self.base_hostname
        );
        debug!(url = %url, "Fetching node specs");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to fetch node specs");
            anyhow::bail!("failed to fetch node specs: {} - {}", status, body);
        }

        let list: NodeListResponse = response.json().await?;
        debug!(node_count = list.nodes.len(), "Fetched node specs");

        Ok(list.nodes)
    }

    async fn mark_node_as_ready(&self, hostname: &HostName) -> Result<()> {
        let url = format!("{}/v1/nodes/{}/state/ready", self.base_url, hostname);
        debug!(hostname = %hostname, "Marking node ready");

        let response = self.client.put(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to mark node ready");
            anyhow::bail!("failed to mark {} ready: {} - {}", hostname, status, body);
        }

        Ok(())
    }

    async fn update_node_attributes(
        &self,
        hostname: &HostName,
        attributes: &NodeAttributes,
    ) -> Result<()> {
        let url = format!("{}/v1/nodes/{}/attributes", self.base_url, hostname);
        debug!(
            hostname = %hostname,
            restart_generation = attributes.restart_generation,
            "Publishing node attributes"
        );

        let response = self.client.patch(&url).json(attributes).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to publish attributes");
            anyhow::bail!(
                "failed to publish attributes for {}: {} - {}",
                hostname,
                status,
                body
            );
        }

        Ok(())
    }
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Debug, Default)]
struct MockNodeRepositoryState {
    specs: Vec<ContainerNodeSpec>,
    fail_attribute_updates: bool,
}

/// Mock node repository with a programmable spec list.
pub struct MockNodeRepository {
    state: Mutex<MockNodeRepositoryState>,
    log: CallLog,
}

impl MockNodeRepository {
    pub fn new() -> Self {
        Self::with_log(CallLog::new())
    }

    pub fn with_log(log: CallLog) -> Self {
        Self {
            state: Mutex::new(MockNodeRepositoryState::default()),
            log,
        }
    }

    pub fn set_specs(&self, specs: Vec<ContainerNodeSpec>) {
        self.state.lock().unwrap().specs = specs;
    }

    pub fn set_fail_attribute_updates(&self, fail: bool) {
        self.state.lock().unwrap().fail_attribute_updates = fail;
    }
}

impl Default for MockNodeRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeRepository for MockNodeRepository {
    async fn get_containers_to_run(&self) -> Result<Vec<ContainerNodeSpec>> {
        Ok(self.state.lock().unwrap().specs.clone())
    }

    async fn mark_node_as_ready(&self, hostname: &HostName) -> Result<()> {
        self.log.record(format!("mark-ready {hostname}"));
        Ok(())
    }

    async fn update_node_attributes(
        &self,
        hostname: &HostName,
        attributes: &NodeAttributes,
    ) -> Result<()> {
        self.log.record(format!(
            "update-attributes {} gen={} image={} version={}",
            hostname,
            attributes.restart_generation,
            attributes
                .docker_image
                .as_ref()
                .map(|i| i.as_str())
                .unwrap_or("-"),
            attributes.runtime_version.as_deref().unwrap_or("-"),
        ));

        if self.state.lock().unwrap().fail_attribute_updates {
            anyhow::bail!("mock node repository configured to fail attribute updates");
        }
        Ok(())
    }
}
