//! Top-level scheduler and the fleet suspend/resume contract.
//!
//! `NodeAdminStateUpdater` owns the fixed-interval poll that feeds desired
//! state to the fleet reconciler, and exposes suspend/resume as a
//! coordinated fleet-wide operation: freezing every agent is a precondition
//! for asking the orchestrator to suspend the host, not a parallel step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::admin::NodeAdmin;
use crate::noderepo::NodeRepository;
use crate::orchestrator::Orchestrator;
use crate::spec::HostName;

/// Wanted fleet-wide state, as requested by an operator or caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetState {
    Resumed,
    Suspended,
}

/// Scheduler for fleet reconciliation plus the suspend/resume contract.
pub struct NodeAdminStateUpdater {
    admin: Arc<Mutex<NodeAdmin>>,
    node_repo: Arc<dyn NodeRepository>,
    orchestrator: Arc<dyn Orchestrator>,

    /// Hostname of the host all managed nodes run on.
    base_hostname: HostName,

    reconcile_interval: Duration,

    /// When false, scheduled polls are no-ops (fleet is suspending or
    /// suspended).
    is_running_updates: AtomicBool,
}

impl NodeAdminStateUpdater {
    pub fn new(
        admin: Arc<Mutex<NodeAdmin>>,
        node_repo: Arc<dyn NodeRepository>,
        orchestrator: Arc<dyn Orchestrator>,
        base_hostname: HostName,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            admin,
            node_repo,
            orchestrator,
            base_hostname,
            reconcile_interval,
            is_running_updates: AtomicBool::new(true),
        }
    }

    /// Run the scheduled poll loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.reconcile_interval.as_secs(),
            "Starting fleet reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.reconcile_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // One bad poll must never stop the schedule.
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Fleet reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single desired-state poll and reconciliation pass.
    pub async fn poll_once(&self) -> Result<()> {
        if !self.is_running_updates.load(Ordering::SeqCst) {
            debug!("Updates paused, skipping poll");
            return Ok(());
        }

        let specs = self.node_repo.get_containers_to_run().await?;
        let mut admin = self.admin.lock().await;
        admin.refresh_containers_to_run(specs).await
    }

    /// Drive the fleet toward the wanted resume state.
    ///
    /// Synchronous and polled: freezing is not instantaneous, so callers
    /// retry until this reports success. On `Suspended`, background updates
    /// are paused and the orchestrator is contacted only once every agent
    /// reports frozen. On `Resumed`, updates restart, agents unfreeze, and
    /// the orchestrator is told the host's nodes are back.
    pub async fn set_resume_state_and_check(&self, wanted: FleetState) -> Result<(), String> {
        match wanted {
            FleetState::Suspended => {
                self.is_running_updates.store(false, Ordering::SeqCst);

                let hosts = {
                    let mut admin = self.admin.lock().await;
                    if !admin.freeze_and_check_all_frozen() {
                        return Err("not all node agents are frozen yet".to_string());
                    }
                    admin.host_names()
                };

                info!(host_count = hosts.len(), "Fleet frozen, requesting host suspension");
                self.orchestrator
                    .suspend_hosts(&self.base_hostname, &hosts)
                    .await
                    .map_err(|e| e.to_string())
            }

            FleetState::Resumed => {
                self.is_running_updates.store(true, Ordering::SeqCst);

                let hosts = {
                    let mut admin = self.admin.lock().await;
                    admin.unfreeze();
                    admin.host_names()
                };

                info!(host_count = hosts.len(), "Fleet unfrozen, resuming hosts");
                self.orchestrator
                    .resume_hosts(&self.base_hostname, &hosts)
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    }

    /// Whether scheduled polls are currently applied.
    pub fn is_running_updates(&self) -> bool {
        self.is_running_updates.load(Ordering::SeqCst)
    }

    /// Human-readable dump of scheduler and per-agent state.
    pub async fn debug_page(&self) -> String {
        let admin = self.admin.lock().await;
        format!(
            "running updates: {}\n{}",
            self.is_running_updates(),
            admin.debug_dump()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NodeAgentContext;
    use crate::engine::{CallLog, MockEngine};
    use crate::noderepo::MockNodeRepository;
    use crate::orchestrator::MockOrchestrator;
    use crate::spec::tests::test_spec;

    fn build_updater(log: &CallLog) -> (NodeAdminStateUpdater, Arc<MockNodeRepository>) {
        let engine = Arc::new(MockEngine::with_log(log.clone()));
        let node_repo = Arc::new(MockNodeRepository::with_log(log.clone()));
        let orchestrator = Arc::new(MockOrchestrator::with_log(log.clone()));

        let ctx = NodeAgentContext {
            engine,
            node_repo: node_repo.clone(),
            orchestrator: orchestrator.clone(),
            node_ctl_path: "/opt/hostfleet/bin/node-ctl".to_string(),
        };
        let admin = Arc::new(Mutex::new(NodeAdmin::new(
            ctx,
            Duration::from_secs(15 * 60),
        )));

        let updater = NodeAdminStateUpdater::new(
            admin,
            node_repo.clone(),
            orchestrator,
            HostName::from("host4.example.com"),
            Duration::from_secs(30),
        );
        (updater, node_repo)
    }

    #[tokio::test]
    async fn test_suspend_of_empty_fleet_contacts_orchestrator() {
        let log = CallLog::new();
        let (updater, _) = build_updater(&log);

        let result = updater.set_resume_state_and_check(FleetState::Suspended).await;
        assert!(result.is_ok());
        assert!(!updater.is_running_updates());
        assert!(log.contains("orchestrator-suspend-hosts host4.example.com []"));

        let page = updater.debug_page().await;
        assert!(page.contains("running updates: false"));
    }

    #[tokio::test]
    async fn test_suspend_fails_before_agents_freeze() {
        let log = CallLog::new();
        let (updater, node_repo) = build_updater(&log);

        // A busy agent exists; the first suspend attempt must fail without
        // contacting the orchestrator.
        node_repo.set_specs(vec![test_spec()]);
        updater.poll_once().await.unwrap();

        let result = updater.set_resume_state_and_check(FleetState::Suspended).await;
        assert_eq!(
            result,
            Err("not all node agents are frozen yet".to_string())
        );
        assert_eq!(log.count_with_prefix("orchestrator-suspend-hosts"), 0);
        assert!(!updater.is_running_updates());

        let page = updater.debug_page().await;
        assert!(page.contains("node1.example.com: state="));
    }

    #[tokio::test]
    async fn test_suspend_succeeds_once_frozen_then_resume() {
        let log = CallLog::new();
        let (updater, node_repo) = build_updater(&log);

        node_repo.set_specs(vec![test_spec()]);
        updater.poll_once().await.unwrap();

        // Poll until the agent acknowledges the freeze.
        let mut result = updater.set_resume_state_and_check(FleetState::Suspended).await;
        for _ in 0..50 {
            if result.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            result = updater.set_resume_state_and_check(FleetState::Suspended).await;
        }
        assert!(result.is_ok());
        assert!(log.contains(
            "orchestrator-suspend-hosts host4.example.com [node1.example.com]"
        ));

        // Paused: polls are no-ops.
        log.clear();
        updater.poll_once().await.unwrap();
        assert!(log.calls().is_empty());

        let result = updater.set_resume_state_and_check(FleetState::Resumed).await;
        assert!(result.is_ok());
        assert!(updater.is_running_updates());
        assert!(log.contains(
            "orchestrator-resume-hosts host4.example.com [node1.example.com]"
        ));
    }
}
