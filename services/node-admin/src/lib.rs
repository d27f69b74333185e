//! hostfleet Node Admin Library
//!
//! The node admin runs on each container host and keeps the host's workload
//! containers converged with the desired state published by the node
//! repository, coordinating safe maintenance windows through the
//! orchestrator and reclaiming unused container images.
//!
//! ## Architecture
//!
//! ```text
//! NodeAdminStateUpdater   (scheduled poll + fleet suspend/resume contract)
//! └── NodeAdmin           (spec/container diff, agent lifecycle, image GC)
//!     └── NodeAgent(hostname)   (per-node worker converging one container)
//! ```
//!
//! Each `NodeAgent` owns a dedicated worker task and a last-write-wins
//! command mailbox; agents are fully independent and all cross-agent
//! coordination happens by issuing commands and polling state, never by a
//! lock spanning agents.
//!
//! ## Modules
//!
//! - `spec`: desired-state data model from the node repository
//! - `engine`: container engine boundary (and mock)
//! - `noderepo` / `orchestrator`: remote collaborator clients (and mocks)
//! - `agent` / `admin` / `updater`: the three control levels

pub mod admin;
pub mod agent;
pub mod config;
pub mod engine;
pub mod noderepo;
pub mod orchestrator;
pub mod spec;
pub mod updater;

// Re-export commonly used types
pub use admin::NodeAdmin;
pub use agent::{spawn_node_agent, AgentCommand, AgentState, NodeAgentContext, NodeAgentHandle};
pub use config::Config;
pub use engine::{CallLog, ContainerEngine, ContainerResources, MockEngine, ProcessResult};
pub use noderepo::{MockNodeRepository, NodeRepository, NodeRepositoryClient};
pub use orchestrator::{MockOrchestrator, Orchestrator, OrchestratorClient, OrchestratorError};
pub use spec::{Container, ContainerNodeSpec, DockerImage, HostName, NodeAttributes, NodeState};
pub use updater::{FleetState, NodeAdminStateUpdater};
