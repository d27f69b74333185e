//! Container engine interface and mock implementation.
//!
//! The engine interface abstracts the host's container runtime:
//! - Listing and inspecting managed containers
//! - Image download/pull/delete
//! - Container start/stop/delete and in-container command execution
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::spec::{Container, ContainerName, DockerImage, HostName};

/// Result of a command executed inside a container.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub output: String,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Minimum resource guarantees passed to the engine when starting a container.
#[derive(Debug, Clone, Copy)]
pub struct ContainerResources {
    pub min_cpu_cores: f64,
    pub min_disk_gb: f64,
    pub min_main_memory_gb: f64,
}

/// Container engine interface.
///
/// All operations are synchronous blocking calls from the caller's point of
/// view; making image pulls asynchronous is the agent's job, not the
/// engine's.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// All containers this engine manages on the host.
    async fn list_managed_containers(&self) -> Result<Vec<Container>>;

    /// The container for one node, if any. At most one per hostname.
    async fn get_container(&self, hostname: &HostName) -> Result<Option<Container>>;

    /// Whether an image is already present locally.
    async fn image_is_downloaded(&self, image: &DockerImage) -> Result<bool>;

    /// Pull an image from its registry. Blocks until complete.
    async fn pull_image(&self, image: &DockerImage) -> Result<()>;

    /// Start a container for a node with the given minimum resources.
    async fn start_container(
        &self,
        image: &DockerImage,
        hostname: &HostName,
        name: &ContainerName,
        resources: &ContainerResources,
    ) -> Result<()>;

    /// Execute a command inside a running container.
    async fn execute_in_container(
        &self,
        name: &ContainerName,
        argv: &[&str],
    ) -> Result<ProcessResult>;

    /// Stop a running container.
    async fn stop_container(&self, name: &ContainerName) -> Result<()>;

    /// Delete a stopped container.
    async fn delete_container(&self, name: &ContainerName) -> Result<()>;

    /// Delete a node's on-disk application storage.
    async fn delete_application_storage(&self, name: &ContainerName) -> Result<()>;

    /// Images present locally but not used by any container.
    async fn list_unused_images(&self) -> Result<HashSet<DockerImage>>;

    /// Delete a locally present image.
    async fn delete_image(&self, image: &DockerImage) -> Result<()>;

    /// Probe the workload runtime version inside a container.
    async fn get_runtime_version(&self, name: &ContainerName) -> Result<String>;
}

// =============================================================================
// Call log
// =============================================================================

/// Shared record of collaborator calls, for asserting ordering in tests.
///
/// The mock engine, node repository, and orchestrator all record into the
/// same log so tests can verify cross-collaborator sequences.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Position of the first call equal to `call`.
    pub fn index_of(&self, call: &str) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| c == call)
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn contains(&self, call: &str) -> bool {
        self.index_of(call).is_some()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

// =============================================================================
// Mock engine
// =============================================================================

#[derive(Debug, Default)]
struct MockEngineState {
    containers: HashMap<HostName, Container>,
    downloaded: HashSet<DockerImage>,
    unused_images: HashSet<DockerImage>,
    runtime_version: Option<String>,
    fail_starts: bool,
    fail_exec: bool,
    fail_pulls: bool,
}

/// Mock engine for testing and development.
///
/// Keeps an in-memory world: starting a container inserts it running,
/// stopping clears the running flag, deleting removes it, pulled images
/// land in the downloaded set.
pub struct MockEngine {
    state: Mutex<MockEngineState>,
    log: CallLog,
    pull_delay: Duration,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::with_log(CallLog::new())
    }

    pub fn with_log(log: CallLog) -> Self {
        Self {
            state: Mutex::new(MockEngineState {
                runtime_version: Some("7.1.3".to_string()),
                ..Default::default()
            }),
            log,
            pull_delay: Duration::from_millis(20),
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    // --- test-world mutators ---

    pub fn add_container(&self, hostname: &HostName, image: &DockerImage, running: bool) {
        let mut state = self.state.lock().unwrap();
        state.downloaded.insert(image.clone());
        state.containers.insert(
            hostname.clone(),
            Container {
                hostname: hostname.clone(),
                name: ContainerName::from_hostname(hostname),
                image: image.clone(),
                running,
            },
        );
    }

    pub fn set_downloaded(&self, image: &DockerImage) {
        self.state.lock().unwrap().downloaded.insert(image.clone());
    }

    pub fn set_unused_images(&self, images: &[DockerImage]) {
        let mut state = self.state.lock().unwrap();
        state.unused_images = images.iter().cloned().collect();
        for image in images {
            state.downloaded.insert(image.clone());
        }
    }

    pub fn set_runtime_version(&self, version: Option<&str>) {
        self.state.lock().unwrap().runtime_version = version.map(|v| v.to_string());
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.state.lock().unwrap().fail_starts = fail;
    }

    pub fn set_fail_exec(&self, fail: bool) {
        self.state.lock().unwrap().fail_exec = fail;
    }

    pub fn set_fail_pulls(&self, fail: bool) {
        self.state.lock().unwrap().fail_pulls = fail;
    }

    // --- test-world observers ---

    pub fn container(&self, hostname: &HostName) -> Option<Container> {
        self.state.lock().unwrap().containers.get(hostname).cloned()
    }

    pub fn has_image(&self, image: &DockerImage) -> bool {
        self.state.lock().unwrap().downloaded.contains(image)
    }

    fn container_by_name(
        state: &MockEngineState,
        name: &ContainerName,
    ) -> Option<(HostName, Container)> {
        state
            .containers
            .iter()
            .find(|(_, c)| c.name == *name)
            .map(|(h, c)| (h.clone(), c.clone()))
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn list_managed_containers(&self) -> Result<Vec<Container>> {
        let state = self.state.lock().unwrap();
        Ok(state.containers.values().cloned().collect())
    }

    async fn get_container(&self, hostname: &HostName) -> Result<Option<Container>> {
        let state = self.state.lock().unwrap();
        Ok(state.containers.get(hostname).cloned())
    }

    async fn image_is_downloaded(&self, image: &DockerImage) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.downloaded.contains(image))
    }

    async fn pull_image(&self, image: &DockerImage) -> Result<()> {
        self.log.record(format!("pull-image {image}"));
        info!(image = %image, "[MOCK] Pulling image");

        tokio::time::sleep(self.pull_delay).await;

        let mut state = self.state.lock().unwrap();
        if state.fail_pulls {
            bail!("mock engine configured to fail pulls");
        }
        state.downloaded.insert(image.clone());
        debug!(image = %image, "[MOCK] Image pulled");
        Ok(())
    }

    async fn start_container(
        &self,
        image: &DockerImage,
        hostname: &HostName,
        name: &ContainerName,
        resources: &ContainerResources,
    ) -> Result<()> {
        self.log.record(format!("start-container {name} {image}"));

        let mut state = self.state.lock().unwrap();
        if state.fail_starts {
            bail!("mock engine configured to fail starts");
        }

        info!(
            hostname = %hostname,
            name = %name,
            image = %image,
            cpu = resources.min_cpu_cores,
            memory_gb = resources.min_main_memory_gb,
            "[MOCK] Starting container"
        );

        state.containers.insert(
            hostname.clone(),
            Container {
                hostname: hostname.clone(),
                name: name.clone(),
                image: image.clone(),
                running: true,
            },
        );
        Ok(())
    }

    async fn execute_in_container(
        &self,
        name: &ContainerName,
        argv: &[&str],
    ) -> Result<ProcessResult> {
        self.log.record(format!("exec {} {}", name, argv.join(" ")));

        let state = self.state.lock().unwrap();
        if state.fail_exec {
            return Ok(ProcessResult {
                exit_code: 1,
                output: "mock exec failure".to_string(),
            });
        }
        if Self::container_by_name(&state, name).is_none() {
            bail!("no container named {name}");
        }

        Ok(ProcessResult {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn stop_container(&self, name: &ContainerName) -> Result<()> {
        self.log.record(format!("stop-container {name}"));

        let mut state = self.state.lock().unwrap();
        let Some((hostname, _)) = Self::container_by_name(&state, name) else {
            bail!("no container named {name}");
        };
        if let Some(container) = state.containers.get_mut(&hostname) {
            container.running = false;
        }
        info!(name = %name, "[MOCK] Container stopped");
        Ok(())
    }

    async fn delete_container(&self, name: &ContainerName) -> Result<()> {
        self.log.record(format!("delete-container {name}"));

        let mut state = self.state.lock().unwrap();
        let Some((hostname, _)) = Self::container_by_name(&state, name) else {
            bail!("no container named {name}");
        };
        state.containers.remove(&hostname);
        info!(name = %name, "[MOCK] Container deleted");
        Ok(())
    }

    async fn delete_application_storage(&self, name: &ContainerName) -> Result<()> {
        self.log.record(format!("delete-app-storage {name}"));
        info!(name = %name, "[MOCK] Application storage deleted");
        Ok(())
    }

    async fn list_unused_images(&self) -> Result<HashSet<DockerImage>> {
        let state = self.state.lock().unwrap();
        Ok(state.unused_images.clone())
    }

    async fn delete_image(&self, image: &DockerImage) -> Result<()> {
        self.log.record(format!("delete-image {image}"));

        let mut state = self.state.lock().unwrap();
        state.unused_images.remove(image);
        state.downloaded.remove(image);
        info!(image = %image, "[MOCK] Image deleted");
        Ok(())
    }

    async fn get_runtime_version(&self, name: &ContainerName) -> Result<String> {
        let state = self.state.lock().unwrap();
        if Self::container_by_name(&state, name).is_none() {
            bail!("no container named {name}");
        }
        match &state.runtime_version {
            Some(version) => Ok(version.clone()),
            None => bail!("version probe failed"),
        }
    }
}
