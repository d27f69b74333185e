//! Desired-state and observed-state data model.
//!
//! A [`ContainerNodeSpec`] is the node repository's desired state for one
//! node; a [`Container`] is what the container engine actually reports for
//! that node. Specs are replaced wholesale on every poll - there are no
//! partial updates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hostname of a managed node. The unique key across the fleet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostName(String);

impl HostName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reference to a container image (registry/repository:tag or digest form).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DockerImage(String);

impl DockerImage {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DockerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DockerImage {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of the container running a node's workload.
///
/// Derived from the node's hostname: the first DNS label, so
/// `node1.region.example.com` runs in container `node1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(String);

impl ContainerName {
    pub fn from_hostname(hostname: &HostName) -> Self {
        let label = hostname
            .as_str()
            .split('.')
            .next()
            .unwrap_or(hostname.as_str());
        Self(label.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a node, as decided by the node repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Provisioned,
    Ready,
    Reserved,
    Active,
    Inactive,
    Dirty,
    Failed,
    Parked,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Provisioned => "provisioned",
            NodeState::Ready => "ready",
            NodeState::Reserved => "reserved",
            NodeState::Active => "active",
            NodeState::Inactive => "inactive",
            NodeState::Dirty => "dirty",
            NodeState::Failed => "failed",
            NodeState::Parked => "parked",
        };
        write!(f, "{s}")
    }
}

/// The tenant application a node is allocated to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOwner {
    pub tenant: String,
    pub application: String,
    pub instance: String,
}

/// A node's position within its owner's cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMembership {
    pub cluster_type: String,
    pub cluster_id: String,
    pub group: String,
    pub index: i64,
    pub retired: bool,
}

/// Desired state for one node, produced by the node repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerNodeSpec {
    pub hostname: HostName,
    pub node_state: NodeState,
    pub node_type: String,

    #[serde(default)]
    pub wanted_docker_image: Option<DockerImage>,
    #[serde(default)]
    pub current_docker_image: Option<DockerImage>,

    #[serde(default)]
    pub wanted_runtime_version: Option<String>,
    #[serde(default)]
    pub current_runtime_version: Option<String>,

    /// Monotonic counters; current < wanted means a restart was requested.
    #[serde(default)]
    pub wanted_restart_generation: i64,
    #[serde(default)]
    pub current_restart_generation: i64,

    #[serde(default)]
    pub wanted_reboot_generation: i64,
    #[serde(default)]
    pub current_reboot_generation: i64,

    #[serde(default)]
    pub allowed_to_be_down: bool,

    #[serde(default)]
    pub owner: Option<NodeOwner>,
    #[serde(default)]
    pub membership: Option<NodeMembership>,

    /// Minimum resource guarantees for the workload container.
    #[serde(default)]
    pub min_cpu_cores: f64,
    #[serde(default)]
    pub min_main_memory_gb: f64,
    #[serde(default)]
    pub min_disk_gb: f64,
    #[serde(default)]
    pub fast_disk: bool,

    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub parent_hostname: Option<HostName>,
}

impl ContainerNodeSpec {
    /// Container name this node's workload runs under.
    pub fn container_name(&self) -> ContainerName {
        ContainerName::from_hostname(&self.hostname)
    }

    /// True when the node repository has requested a container restart.
    pub fn restart_requested(&self) -> bool {
        self.current_restart_generation < self.wanted_restart_generation
    }
}

/// A container observed on the host, keyed by the node's hostname.
///
/// The engine guarantees at most one container per hostname; it may be
/// absent, present-and-running, or present-and-stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub hostname: HostName,
    pub name: ContainerName,
    pub image: DockerImage,
    pub running: bool,
}

/// Node attributes published back to the node repository after convergence.
///
/// `PartialEq` drives publish-on-change: the agent republishes only when the
/// computed attributes differ from the last successfully published set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAttributes {
    pub restart_generation: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<DockerImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
}
