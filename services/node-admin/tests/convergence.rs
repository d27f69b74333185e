//! End-to-end convergence scenarios for a single node agent.
//!
//! These drive a real agent worker against the mock engine, node
//! repository, and orchestrator, and assert on the recorded call sequences:
//! removal ordering, hook invocation counts, and publish-on-change.

use std::sync::Arc;
use std::time::Duration;

use hostfleet_node_admin::agent::{spawn_node_agent, NodeAgentContext, NodeAgentHandle};
use hostfleet_node_admin::engine::{CallLog, MockEngine};
use hostfleet_node_admin::noderepo::MockNodeRepository;
use hostfleet_node_admin::orchestrator::MockOrchestrator;
use hostfleet_node_admin::spec::{ContainerNodeSpec, DockerImage, HostName, NodeState};

const NODE_CTL: &str = "/opt/hostfleet/bin/node-ctl";

struct TestWorld {
    log: CallLog,
    engine: Arc<MockEngine>,
    node_repo: Arc<MockNodeRepository>,
    orchestrator: Arc<MockOrchestrator>,
    ctx: NodeAgentContext,
}

fn test_world() -> TestWorld {
    let log = CallLog::new();
    let engine = Arc::new(MockEngine::with_log(log.clone()));
    let node_repo = Arc::new(MockNodeRepository::with_log(log.clone()));
    let orchestrator = Arc::new(MockOrchestrator::with_log(log.clone()));

    let ctx = NodeAgentContext {
        engine: engine.clone(),
        node_repo: node_repo.clone(),
        orchestrator: orchestrator.clone(),
        node_ctl_path: NODE_CTL.to_string(),
    };

    TestWorld {
        log,
        engine,
        node_repo,
        orchestrator,
        ctx,
    }
}

fn active_spec(hostname: &str, image: &str) -> ContainerNodeSpec {
    ContainerNodeSpec {
        hostname: HostName::from(hostname),
        node_state: NodeState::Active,
        node_type: "tenant".to_string(),
        wanted_docker_image: Some(DockerImage::from(image)),
        current_docker_image: None,
        wanted_runtime_version: None,
        current_runtime_version: None,
        wanted_restart_generation: 1,
        current_restart_generation: 1,
        wanted_reboot_generation: 0,
        current_reboot_generation: 0,
        allowed_to_be_down: false,
        owner: None,
        membership: None,
        min_cpu_cores: 2.0,
        min_main_memory_gb: 8.0,
        min_disk_gb: 100.0,
        fast_disk: false,
        ip_addresses: vec![],
        parent_hostname: None,
    }
}

/// Poll until the log contains `call`, panicking after two seconds.
async fn wait_for_call(log: &CallLog, call: &str) {
    for _ in 0..200 {
        if log.contains(call) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for call {call:?}; log: {:#?}", log.calls());
}

/// Poll until the log has `count` calls with `prefix`, panicking after two
/// seconds.
async fn wait_for_count(log: &CallLog, prefix: &str, count: usize) {
    for _ in 0..200 {
        if log.count_with_prefix(prefix) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {count} calls with prefix {prefix:?}; log: {:#?}",
        log.calls()
    );
}

fn assert_ordered(log: &CallLog, calls: &[&str]) {
    let mut last = None;
    for call in calls {
        let index = log
            .index_of(call)
            .unwrap_or_else(|| panic!("call {call:?} not found in log: {:#?}", log.calls()));
        if let Some((previous, previous_index)) = last {
            assert!(
                index > previous_index,
                "expected {previous:?} before {call:?}; log: {:#?}",
                log.calls()
            );
        }
        last = Some((call, index));
    }
}

async fn drop_agent(agent: NodeAgentHandle) {
    agent.terminate().await;
}

#[tokio::test]
async fn test_upgrade_of_active_node() {
    let world = test_world();
    let hostname = HostName::from("node1.example.com");

    // Running on v1; the repository wants v2 plus a restart.
    world
        .engine
        .add_container(&hostname, &DockerImage::from("img:v1"), true);
    world.engine.set_downloaded(&DockerImage::from("img:v2"));

    let mut spec = active_spec("node1.example.com", "img:v2");
    spec.current_docker_image = Some(DockerImage::from("img:v1"));
    spec.current_restart_generation = 1;
    spec.wanted_restart_generation = 2;

    let agent = spawn_node_agent(spec, world.ctx.clone());
    wait_for_call(&world.log, "orchestrator-resume node1.example.com").await;

    assert_ordered(
        &world.log,
        &[
            "orchestrator-suspend node1.example.com",
            "exec node1 /opt/hostfleet/bin/node-ctl suspend",
            "stop-container node1",
            "delete-container node1",
            "start-container node1 img:v2",
            "exec node1 /opt/hostfleet/bin/node-ctl resume",
            "update-attributes node1.example.com gen=2 image=img:v2 version=7.1.3",
            "orchestrator-resume node1.example.com",
        ],
    );

    // The resume hook ran exactly once for the new container.
    assert_eq!(
        world.log.count_with_prefix("exec node1 /opt/hostfleet/bin/node-ctl resume"),
        1
    );

    let container = world.engine.container(&hostname).unwrap();
    assert!(container.running);
    assert_eq!(container.image, DockerImage::from("img:v2"));

    drop_agent(agent).await;
}

#[tokio::test]
async fn test_dirty_node_is_cleaned_and_marked_ready() {
    let world = test_world();
    let hostname = HostName::from("node2.example.com");

    world
        .engine
        .add_container(&hostname, &DockerImage::from("img:v1"), true);

    let mut spec = active_spec("node2.example.com", "img:v1");
    spec.node_state = NodeState::Dirty;
    spec.wanted_docker_image = None;

    let agent = spawn_node_agent(spec, world.ctx.clone());
    wait_for_call(&world.log, "mark-ready node2.example.com").await;

    // Not active, so no out-of-service permission is needed.
    assert_eq!(world.log.count_with_prefix("orchestrator-suspend"), 0);
    assert_ordered(
        &world.log,
        &[
            "stop-container node2",
            "delete-container node2",
            "delete-app-storage node2",
            "mark-ready node2.example.com",
        ],
    );
    assert!(world.engine.container(&hostname).is_none());

    drop_agent(agent).await;
}

#[tokio::test]
async fn test_denied_suspend_leaves_container_running() {
    let world = test_world();
    let hostname = HostName::from("node3.example.com");

    world
        .engine
        .add_container(&hostname, &DockerImage::from("img:v1"), true);
    world.engine.set_downloaded(&DockerImage::from("img:v2"));
    world.orchestrator.set_allow_suspend(false);

    let spec = active_spec("node3.example.com", "img:v2");
    let agent = spawn_node_agent(spec, world.ctx.clone());

    wait_for_call(&world.log, "orchestrator-suspend node3.example.com").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Permission was asked and denied; nothing was stopped or deleted.
    assert_eq!(world.log.count_with_prefix("stop-container"), 0);
    assert_eq!(world.log.count_with_prefix("delete-container"), 0);
    let container = world.engine.container(&hostname).unwrap();
    assert!(container.running);
    assert_eq!(container.image, DockerImage::from("img:v1"));

    drop_agent(agent).await;
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let world = test_world();
    let hostname = HostName::from("node4.example.com");

    world
        .engine
        .add_container(&hostname, &DockerImage::from("img:v1"), true);

    let spec = active_spec("node4.example.com", "img:v1");
    let agent = spawn_node_agent(spec.clone(), world.ctx.clone());
    wait_for_count(&world.log, "orchestrator-resume node4.example.com", 1).await;

    // Same spec again: no container churn and no redundant publish.
    agent.update_from_node_repo(spec);
    wait_for_count(&world.log, "orchestrator-resume node4.example.com", 2).await;

    assert_eq!(world.log.count_with_prefix("start-container"), 0);
    assert_eq!(world.log.count_with_prefix("stop-container"), 0);
    assert_eq!(world.log.count_with_prefix("delete-container"), 0);
    assert_eq!(world.log.count_with_prefix("update-attributes"), 1);
    assert_eq!(
        world.log.count_with_prefix("exec node4 /opt/hostfleet/bin/node-ctl resume"),
        1
    );

    drop_agent(agent).await;
}

#[tokio::test]
async fn test_failed_suspend_hook_does_not_block_removal() {
    let world = test_world();
    let hostname = HostName::from("node5.example.com");

    world
        .engine
        .add_container(&hostname, &DockerImage::from("img:v1"), true);
    world.engine.set_downloaded(&DockerImage::from("img:v2"));
    world.engine.set_fail_exec(true);

    let spec = active_spec("node5.example.com", "img:v2");
    let agent = spawn_node_agent(spec, world.ctx.clone());

    // Removal completes despite the failing suspend hook; the resume hook
    // also fails (exec is broken), so the pass stops there and the old
    // container is already gone.
    wait_for_call(&world.log, "delete-container node5").await;
    assert_ordered(
        &world.log,
        &[
            "exec node5 /opt/hostfleet/bin/node-ctl suspend",
            "stop-container node5",
            "delete-container node5",
        ],
    );

    drop_agent(agent).await;
}

#[tokio::test]
async fn test_wanted_image_is_pulled_asynchronously() {
    let world = test_world();
    let hostname = HostName::from("node6.example.com");

    // No container and the wanted image is not local yet.
    let spec = active_spec("node6.example.com", "img:v1");
    let agent = spawn_node_agent(spec, world.ctx.clone());

    wait_for_call(&world.log, "pull-image img:v1").await;
    // The convergence pass ended without blocking on the pull.
    assert_eq!(world.log.count_with_prefix("start-container"), 0);

    // Pull completion wakes the agent, which then starts the container.
    wait_for_call(&world.log, "start-container node6 img:v1").await;
    wait_for_call(&world.log, "orchestrator-resume node6.example.com").await;

    let container = world.engine.container(&hostname).unwrap();
    assert!(container.running);

    drop_agent(agent).await;
}

#[tokio::test]
async fn test_resume_is_withheld_until_attributes_publish() {
    let world = test_world();
    let hostname = HostName::from("node7.example.com");

    world
        .engine
        .add_container(&hostname, &DockerImage::from("img:v1"), true);
    world.node_repo.set_fail_attribute_updates(true);

    let spec = active_spec("node7.example.com", "img:v1");
    let agent = spawn_node_agent(spec.clone(), world.ctx.clone());

    wait_for_call(
        &world.log,
        "update-attributes node7.example.com gen=1 image=img:v1 version=7.1.3",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(world.log.count_with_prefix("orchestrator-resume"), 0);

    // Once publishing works, a later pass resumes the node. Deliver the
    // spec repeatedly, like the scheduler's poll would, to ride out the
    // agent's failure backoff.
    world.node_repo.set_fail_attribute_updates(false);
    for _ in 0..40 {
        agent.update_from_node_repo(spec.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        if world.log.contains("orchestrator-resume node7.example.com") {
            break;
        }
    }
    wait_for_call(&world.log, "orchestrator-resume node7.example.com").await;

    drop_agent(agent).await;
}

#[tokio::test]
async fn test_version_probe_failure_is_best_effort() {
    let world = test_world();
    let hostname = HostName::from("node8.example.com");

    world
        .engine
        .add_container(&hostname, &DockerImage::from("img:v1"), true);
    world.engine.set_runtime_version(None);

    let spec = active_spec("node8.example.com", "img:v1");
    let agent = spawn_node_agent(spec, world.ctx.clone());

    wait_for_call(
        &world.log,
        "update-attributes node8.example.com gen=1 image=img:v1 version=-",
    )
    .await;
    wait_for_call(&world.log, "orchestrator-resume node8.example.com").await;

    drop_agent(agent).await;
}
