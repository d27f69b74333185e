//! Node agent - per-node state machine converging one host's container.
//!
//! Each agent owns a dedicated worker task and a single-slot command
//! mailbox. Commands are last-write-wins: sending `Freeze` then `Unfreeze`
//! before the worker observes either is equivalent to never freezing.
//!
//! ## State Machine
//!
//! ```text
//! waiting <-> working        (converge, then park)
//! waiting/working -> frozen  (Freeze command)
//! frozen -> working          (Unfreeze command)
//! any -> terminated          (Terminate command, irreversible)
//! ```
//!
//! The worker task is the only writer of the observable state; commands
//! only set the wanted target.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use hostfleet_reconcile::BackoffPolicy;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, ContainerResources};
use crate::noderepo::NodeRepository;
use crate::orchestrator::Orchestrator;
use crate::spec::{Container, ContainerNodeSpec, DockerImage, HostName, NodeAttributes, NodeState};

// =============================================================================
// Commands and states
// =============================================================================

/// Commands accepted by a node agent.
#[derive(Debug, Clone)]
pub enum AgentCommand {
    /// A fresh spec arrived from the node repository; converge to it.
    UpdateFromNodeRepo(Box<ContainerNodeSpec>),

    /// Pause convergence for fleet-wide maintenance.
    Freeze,

    /// Resume convergence after a freeze.
    Unfreeze,

    /// Stop the agent. Irreversible.
    Terminate,
}

impl AgentCommand {
    pub fn label(&self) -> &'static str {
        match self {
            AgentCommand::UpdateFromNodeRepo(_) => "update-from-node-repo",
            AgentCommand::Freeze => "freeze",
            AgentCommand::Unfreeze => "unfreeze",
            AgentCommand::Terminate => "terminate",
        }
    }
}

/// Observable state of a node agent, committed only by its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Idle; nothing to do until the next command.
    Waiting,
    /// Actively converging the node.
    Working,
    /// Paused by a fleet-wide freeze.
    Frozen,
    /// Stopped for good.
    Terminated,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Waiting => "waiting",
            AgentState::Working => "working",
            AgentState::Frozen => "frozen",
            AgentState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Handle
// =============================================================================

/// External collaborators a node agent converges against.
#[derive(Clone)]
pub struct NodeAgentContext {
    pub engine: Arc<dyn ContainerEngine>,
    pub node_repo: Arc<dyn NodeRepository>,
    pub orchestrator: Arc<dyn Orchestrator>,

    /// Path of the node-control program inside workload containers.
    pub node_ctl_path: String,
}

/// Handle to a running node agent.
///
/// Dropping the handle without calling [`terminate`] closes the mailbox,
/// which also stops the worker.
///
/// [`terminate`]: NodeAgentHandle::terminate
pub struct NodeAgentHandle {
    hostname: HostName,
    command_tx: watch::Sender<AgentCommand>,
    state_rx: watch::Receiver<AgentState>,
    worker: JoinHandle<()>,
}

impl NodeAgentHandle {
    pub fn hostname(&self) -> &HostName {
        &self.hostname
    }

    /// Deliver a fresh spec and request a convergence pass.
    pub fn update_from_node_repo(&self, spec: ContainerNodeSpec) {
        let _ = self
            .command_tx
            .send(AgentCommand::UpdateFromNodeRepo(Box::new(spec)));
    }

    pub fn freeze(&self) {
        let _ = self.command_tx.send(AgentCommand::Freeze);
    }

    pub fn unfreeze(&self) {
        let _ = self.command_tx.send(AgentCommand::Unfreeze);
    }

    /// The state the worker last committed.
    pub fn current_state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// The latest command, acknowledged or not.
    pub fn wanted_command(&self) -> &'static str {
        self.command_tx.borrow().label()
    }

    /// Stop the agent and wait for its worker to finish.
    pub async fn terminate(mut self) {
        let _ = self.command_tx.send(AgentCommand::Terminate);

        if tokio::time::timeout(Duration::from_secs(10), &mut self.worker)
            .await
            .is_err()
        {
            warn!(hostname = %self.hostname, "Agent worker did not stop in time, aborting");
            self.worker.abort();
        }
    }
}

/// Spawn a node agent for a hostname that just appeared in the desired set.
///
/// The initial spec doubles as the first `UpdateFromNodeRepo` command, so a
/// new agent converges immediately.
pub fn spawn_node_agent(spec: ContainerNodeSpec, ctx: NodeAgentContext) -> NodeAgentHandle {
    let hostname = spec.hostname.clone();
    let (command_tx, command_rx) =
        watch::channel(AgentCommand::UpdateFromNodeRepo(Box::new(spec)));
    let (state_tx, state_rx) = watch::channel(AgentState::Waiting);

    let worker = NodeAgentWorker {
        hostname: hostname.clone(),
        ctx,
        command_rx,
        state_tx,
        wake: Arc::new(Notify::new()),
        spec: None,
        node_started: false,
        last_published: None,
        pull_in_flight: Arc::new(Mutex::new(None)),
        backoff: BackoffPolicy::default(),
        consecutive_failures: 0,
        retry_after: None,
    };

    let task = tokio::spawn(worker.run());

    NodeAgentHandle {
        hostname,
        command_tx,
        state_rx,
        worker: task,
    }
}

// =============================================================================
// Worker
// =============================================================================

struct NodeAgentWorker {
    hostname: HostName,
    ctx: NodeAgentContext,
    command_rx: watch::Receiver<AgentCommand>,
    state_tx: watch::Sender<AgentState>,

    /// Signaled by a finished async image pull to request another pass.
    wake: Arc<Notify>,

    /// Last spec delivered by the fleet reconciler.
    spec: Option<ContainerNodeSpec>,

    /// Whether the node program has been resumed in the current container.
    node_started: bool,

    /// Last successfully published attributes, to suppress redundant publishes.
    last_published: Option<NodeAttributes>,

    /// Image currently being pulled in the background, if any.
    pull_in_flight: Arc<Mutex<Option<DockerImage>>>,

    backoff: BackoffPolicy,
    consecutive_failures: u32,
    retry_after: Option<Instant>,
}

impl NodeAgentWorker {
    async fn run(mut self) {
        info!(hostname = %self.hostname, "Node agent started");

        loop {
            let command = self.command_rx.borrow_and_update().clone();
            match command {
                AgentCommand::Terminate => break,

                AgentCommand::Freeze => {
                    self.set_state(AgentState::Frozen);
                    if self.command_rx.changed().await.is_err() {
                        break;
                    }
                }

                AgentCommand::UpdateFromNodeRepo(spec) => {
                    self.spec = Some(*spec);
                    self.work().await;
                    if self.park().await.is_err() {
                        break;
                    }
                }

                AgentCommand::Unfreeze => {
                    self.work().await;
                    if self.park().await.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_state(AgentState::Terminated);
        info!(hostname = %self.hostname, "Node agent terminated");
    }

    /// Park as waiting until the next command or pull-completion wake-up.
    ///
    /// Returns `Err` when the handle is gone and the worker should exit.
    async fn park(&mut self) -> Result<(), ()> {
        loop {
            match self.command_rx.has_changed() {
                // A newer command arrived while working; let the main loop
                // pick it up.
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(_) => return Err(()),
            }

            self.set_state(AgentState::Waiting);

            tokio::select! {
                changed = self.command_rx.changed() => {
                    return changed.map_err(|_| ());
                }
                _ = self.wake.notified() => {
                    self.work().await;
                }
            }
        }
    }

    /// Run one convergence pass, if not gated by failure backoff.
    async fn work(&mut self) {
        self.set_state(AgentState::Working);

        if let Some(until) = self.retry_after {
            if Instant::now() < until {
                debug!(hostname = %self.hostname, "In failure backoff, skipping pass");
                return;
            }
        }

        let Some(spec) = self.spec.clone() else {
            return;
        };

        match self.converge(&spec).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.retry_after = None;
            }
            Err(e) => {
                let delay = self.backoff.delay(self.consecutive_failures);
                self.consecutive_failures += 1;
                self.retry_after = Some(Instant::now() + delay);
                warn!(
                    hostname = %self.hostname,
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    backoff_ms = delay.as_millis() as u64,
                    "Convergence pass failed"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Convergence
    // -------------------------------------------------------------------------

    async fn converge(&mut self, spec: &ContainerNodeSpec) -> Result<()> {
        // An active node needs its wanted image before anything else. The
        // pull runs in the background; this pass ends and a later one picks
        // up once the image is local.
        if spec.node_state == NodeState::Active {
            if let Some(wanted) = &spec.wanted_docker_image {
                if !self.ctx.engine.image_is_downloaded(wanted).await? {
                    self.schedule_image_pull(wanted.clone());
                    return Ok(());
                }
            }
        }

        let mut container = self.ctx.engine.get_container(&spec.hostname).await?;

        if let Some(existing) = &container {
            if let Some(reason) = removal_reason(spec, existing) {
                self.remove_container(spec, existing, &reason).await?;
                container = None;
            }
        }

        match spec.node_state {
            NodeState::Dirty | NodeState::Provisioned => {
                info!(
                    hostname = %self.hostname,
                    node_state = %spec.node_state,
                    "Cleaning node storage and marking ready"
                );
                self.ctx
                    .engine
                    .delete_application_storage(&spec.container_name())
                    .await?;
                self.ctx.node_repo.mark_node_as_ready(&spec.hostname).await?;
            }

            NodeState::Active => {
                if container.is_none() {
                    self.start_container(spec).await?;
                }
                self.resume_node_program(spec).await?;
                self.publish_attributes(spec).await?;
                // Resume stays last: the node must not be reported back in
                // service before its attributes are confirmed published.
                self.ctx.orchestrator.resume_node(&spec.hostname).await?;
            }

            _ => {}
        }

        Ok(())
    }

    /// Remove the node's container, coordinating with the orchestrator when
    /// the node is in service.
    async fn remove_container(
        &mut self,
        spec: &ContainerNodeSpec,
        container: &Container,
        reason: &str,
    ) -> Result<()> {
        info!(
            hostname = %self.hostname,
            container = %container.name,
            reason = %reason,
            "Removing container"
        );

        if spec.node_state == NodeState::Active {
            self.ctx
                .orchestrator
                .suspend_node(&spec.hostname)
                .await
                .with_context(|| format!("cannot take {} out of service", spec.hostname))?;
        }

        if container.running {
            // Best effort: a failing suspend hook must not leave the node
            // stuck on an old image.
            match self
                .ctx
                .engine
                .execute_in_container(&container.name, &[self.ctx.node_ctl_path.as_str(), "suspend"])
                .await
            {
                Ok(result) if result.success() => {}
                Ok(result) => warn!(
                    hostname = %self.hostname,
                    exit_code = result.exit_code,
                    output = %result.output,
                    "Suspend hook failed, removing anyway"
                ),
                Err(e) => warn!(
                    hostname = %self.hostname,
                    error = %e,
                    "Suspend hook could not run, removing anyway"
                ),
            }

            self.ctx.engine.stop_container(&container.name).await?;
        }

        self.ctx.engine.delete_container(&container.name).await?;
        self.node_started = false;
        Ok(())
    }

    async fn start_container(&mut self, spec: &ContainerNodeSpec) -> Result<()> {
        let image = spec
            .wanted_docker_image
            .clone()
            .with_context(|| format!("active node {} has no wanted image", spec.hostname))?;

        let resources = ContainerResources {
            min_cpu_cores: spec.min_cpu_cores,
            min_disk_gb: spec.min_disk_gb,
            min_main_memory_gb: spec.min_main_memory_gb,
        };

        info!(
            hostname = %self.hostname,
            image = %image,
            cpu = resources.min_cpu_cores,
            memory_gb = resources.min_main_memory_gb,
            "Starting container"
        );

        self.ctx
            .engine
            .start_container(&image, &spec.hostname, &spec.container_name(), &resources)
            .await?;
        self.node_started = false;
        Ok(())
    }

    /// Resume the node program, once per container instance.
    async fn resume_node_program(&mut self, spec: &ContainerNodeSpec) -> Result<()> {
        if self.node_started {
            return Ok(());
        }

        let result = self
            .ctx
            .engine
            .execute_in_container(&spec.container_name(), &[self.ctx.node_ctl_path.as_str(), "resume"])
            .await?;
        if !result.success() {
            bail!(
                "resume hook exited with {}: {}",
                result.exit_code,
                result.output
            );
        }

        self.node_started = true;
        Ok(())
    }

    /// Publish converged attributes, but only when they changed.
    async fn publish_attributes(&mut self, spec: &ContainerNodeSpec) -> Result<()> {
        let runtime_version = match self
            .ctx
            .engine
            .get_runtime_version(&spec.container_name())
            .await
        {
            Ok(version) => Some(version),
            Err(e) => {
                debug!(hostname = %self.hostname, error = %e, "Runtime version probe failed");
                None
            }
        };

        let attributes = NodeAttributes {
            restart_generation: spec.wanted_restart_generation,
            docker_image: spec.wanted_docker_image.clone(),
            runtime_version,
        };

        if self.last_published.as_ref() == Some(&attributes) {
            return Ok(());
        }

        self.ctx
            .node_repo
            .update_node_attributes(&spec.hostname, &attributes)
            .await?;
        self.last_published = Some(attributes);
        Ok(())
    }

    /// Kick off a background image pull, at most one per wanted image.
    ///
    /// On success the worker is woken for another pass; on failure the next
    /// scheduled spec delivery retries the pull.
    fn schedule_image_pull(&self, image: DockerImage) {
        {
            let mut in_flight = self.pull_in_flight.lock().unwrap();
            if in_flight.as_ref() == Some(&image) {
                debug!(hostname = %self.hostname, image = %image, "Image pull already in flight");
                return;
            }
            *in_flight = Some(image.clone());
        }

        info!(hostname = %self.hostname, image = %image, "Scheduling image pull");

        let engine = Arc::clone(&self.ctx.engine);
        let wake = Arc::clone(&self.wake);
        let in_flight = Arc::clone(&self.pull_in_flight);
        let hostname = self.hostname.clone();

        tokio::spawn(async move {
            let result = engine.pull_image(&image).await;
            *in_flight.lock().unwrap() = None;

            match result {
                Ok(()) => {
                    info!(hostname = %hostname, image = %image, "Image pull complete");
                    wake.notify_one();
                }
                Err(e) => {
                    warn!(hostname = %hostname, image = %image, error = %e, "Image pull failed");
                }
            }
        });
    }

    fn set_state(&self, state: AgentState) {
        if *self.state_tx.borrow() != state {
            debug!(hostname = %self.hostname, state = %state, "Agent state changed");
        }
        let _ = self.state_tx.send(state);
    }
}

/// Why a container must be removed before its node can converge, if at all.
fn removal_reason(spec: &ContainerNodeSpec, container: &Container) -> Option<String> {
    if spec.node_state != NodeState::Active {
        return Some(format!("node is {}", spec.node_state));
    }

    if let Some(wanted) = &spec.wanted_docker_image {
        if *wanted != container.image {
            return Some(format!(
                "running image {} differs from wanted {}",
                container.image, wanted
            ));
        }
    }

    if spec.restart_requested() {
        return Some(format!(
            "restart requested (generation {} -> {})",
            spec.current_restart_generation, spec.wanted_restart_generation
        ));
    }

    if !container.running {
        return Some("container is not running".to_string());
    }

    None
}

// =============================================================================
// Tests
// =============================================================================
