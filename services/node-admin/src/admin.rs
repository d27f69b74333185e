//! Fleet reconciler - owns one agent per managed node.
//!
//! `NodeAdmin` diffs the desired spec set against the containers actually
//! observed on the host, keeps the agent map in step with the desired set,
//! and garbage-collects container images that have been unused past a grace
//! period.
//!
//! Mutation happens on the scheduler's single call path; the suspend/resume
//! path shares the instance behind a mutex (see `updater`).

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::time::Instant;

use anyhow::Result;
use hostfleet_reconcile::{full_outer_join, GcLedger, JoinEntry};
use tracing::{debug, info, warn};

use crate::agent::{spawn_node_agent, AgentState, NodeAgentContext, NodeAgentHandle};
use crate::spec::{Container, ContainerNodeSpec, DockerImage, HostName};

/// Fleet reconciler.
pub struct NodeAdmin {
    ctx: NodeAgentContext,

    /// One agent per hostname currently in the desired set.
    agents: HashMap<HostName, NodeAgentHandle>,

    /// Unused-image ledger driving grace-period GC.
    image_gc: GcLedger<DockerImage>,
}

impl NodeAdmin {
    pub fn new(ctx: NodeAgentContext, image_gc_grace: std::time::Duration) -> Self {
        Self {
            ctx,
            agents: HashMap::new(),
            image_gc: GcLedger::new(image_gc_grace),
        }
    }

    /// Reconcile the agent map against a freshly fetched spec set.
    ///
    /// Performs a full outer join of specs against observed containers:
    /// every hostname with a spec gets an agent (created if needed) and an
    /// update signal; containers without a spec are left alone; agents
    /// whose hostname left the desired set are stopped before returning.
    pub async fn refresh_containers_to_run(&mut self, specs: Vec<ContainerNodeSpec>) -> Result<()> {
        let observed = self.ctx.engine.list_managed_containers().await?;

        let referenced = referenced_images(&specs);
        let desired: HashMap<HostName, ContainerNodeSpec> = specs
            .into_iter()
            .map(|spec| (spec.hostname.clone(), spec))
            .collect();
        let observed: HashMap<HostName, Container> = observed
            .into_iter()
            .map(|container| (container.hostname.clone(), container))
            .collect();

        debug!(
            desired = desired.len(),
            observed = observed.len(),
            agents = self.agents.len(),
            "Reconciling fleet"
        );

        let desired_hosts: HashSet<HostName> = desired.keys().cloned().collect();

        for (hostname, entry) in full_outer_join(desired, observed) {
            match entry {
                JoinEntry::Both(spec, _) | JoinEntry::DesiredOnly(spec) => {
                    self.ensure_agent(spec);
                }
                JoinEntry::ObservedOnly(container) => {
                    // Acting on the absence of a spec is unsafe; never touch
                    // containers outside the desired set.
                    warn!(
                        hostname = %hostname,
                        container = %container.name,
                        "Container has no spec in the node repository, leaving it alone"
                    );
                }
            }
        }

        self.remove_stale_agents(&desired_hosts).await;
        self.sweep_unused_images(&referenced).await;

        Ok(())
    }

    /// Create the agent if missing, then deliver the fresh spec.
    fn ensure_agent(&mut self, spec: ContainerNodeSpec) {
        match self.agents.get(&spec.hostname) {
            Some(agent) => agent.update_from_node_repo(spec),
            None => {
                info!(hostname = %spec.hostname, "Creating node agent");
                let agent = spawn_node_agent(spec, self.ctx.clone());
                self.agents.insert(agent.hostname().clone(), agent);
            }
        }
    }

    /// Stop agents for hostnames that disappeared from the desired set,
    /// synchronously, before the refresh returns.
    ///
    /// A stopped agent is never restarted; if the hostname reappears later
    /// a new agent is created for it.
    async fn remove_stale_agents(&mut self, desired_hosts: &HashSet<HostName>) {
        let stale: Vec<HostName> = self
            .agents
            .keys()
            .filter(|hostname| !desired_hosts.contains(*hostname))
            .cloned()
            .collect();

        for hostname in stale {
            if let Some(agent) = self.agents.remove(&hostname) {
                info!(hostname = %hostname, "Node left the desired set, stopping its agent");
                agent.terminate().await;
            }
        }
    }

    /// Pause every agent, then report whether all have acknowledged.
    ///
    /// Non-blocking: callers poll this until it returns true or they give
    /// up. Agents finish any in-flight convergence pass before freezing.
    pub fn freeze_and_check_all_frozen(&mut self) -> bool {
        for agent in self.agents.values() {
            agent.freeze();
        }
        self.agents
            .values()
            .all(|agent| agent.current_state() == AgentState::Frozen)
    }

    /// Resume every agent. Fire-and-forget.
    pub fn unfreeze(&mut self) {
        for agent in self.agents.values() {
            agent.unfreeze();
        }
    }

    /// Hostnames of all managed nodes.
    pub fn host_names(&self) -> Vec<HostName> {
        let mut hosts: Vec<_> = self.agents.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Observable state of one agent, if it exists.
    pub fn agent_state(&self, hostname: &HostName) -> Option<AgentState> {
        self.agents.get(hostname).map(|agent| agent.current_state())
    }

    /// Human-readable dump of per-agent state for the debug page.
    pub fn debug_dump(&self) -> String {
        let mut out = String::new();
        for hostname in self.host_names() {
            if let Some(agent) = self.agents.get(&hostname) {
                let _ = writeln!(
                    out,
                    "{}: state={} wanted={}",
                    hostname,
                    agent.current_state(),
                    agent.wanted_command()
                );
            }
        }
        let _ = writeln!(out, "images tracked for gc: {}", self.image_gc.tracked());
        out
    }

    /// Stop every agent. Used on shutdown.
    pub async fn stop_all(&mut self) {
        info!(count = self.agents.len(), "Stopping all node agents");
        for (_, agent) in self.agents.drain() {
            agent.terminate().await;
        }
    }

    /// Delete images that have been continuously unused past the grace
    /// period. Failures are logged and retried on the next sweep; they
    /// never fail the refresh.
    async fn sweep_unused_images(&mut self, referenced: &HashSet<DockerImage>) {
        let unused = match self.ctx.engine.list_unused_images().await {
            Ok(unused) => unused,
            Err(e) => {
                warn!(error = %e, "Could not list unused images, skipping GC");
                return;
            }
        };

        let candidates: HashSet<DockerImage> =
            unused.difference(referenced).cloned().collect();
        let expired = self.image_gc.update(&candidates, Instant::now());

        for image in expired {
            info!(image = %image, "Deleting unused image");
            match self.ctx.engine.delete_image(&image).await {
                Ok(()) => self.image_gc.remove(&image),
                Err(e) => warn!(image = %image, error = %e, "Failed to delete image"),
            }
        }
    }
}

/// Images any pending spec still refers to, wanted or current.
fn referenced_images(specs: &[ContainerNodeSpec]) -> HashSet<DockerImage> {
    specs
        .iter()
        .flat_map(|spec| {
            spec.wanted_docker_image
                .iter()
                .chain(spec.current_docker_image.iter())
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referenced_images_includes_wanted_and_current() {
        let mut spec_a = crate::spec::tests::test_spec();
        spec_a.wanted_docker_image = Some(DockerImage::from("app:7.1"));
        spec_a.current_docker_image = Some(DockerImage::from("app:7.0"));

        let mut spec_b = crate::spec::tests::test_spec();
        spec_b.hostname = HostName::from("node2.example.com");
        spec_b.wanted_docker_image = Some(DockerImage::from("app:7.1"));
        spec_b.current_docker_image = None;

        let referenced = referenced_images(&[spec_a, spec_b]);
        assert_eq!(referenced.len(), 2);
        assert!(referenced.contains(&DockerImage::from("app:7.1")));
        assert!(referenced.contains(&DockerImage::from("app:7.0")));
    }
}
