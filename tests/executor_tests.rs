use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use cellexec::config::ExecutorConfig;
use cellexec::executor::ExecutorError;
use cellexec::gateway::InMemoryGateway;
use cellexec::models::{
    Action, Container, ContainerSpec, ContainerState, EnvironmentVariable, ExecutorResources, PortMapping, Tags,
};
use cellexec::server::rest::create_router;
use cellexec::Executor;

fn test_config() -> ExecutorConfig {
    ExecutorConfig {
        memory_mb: Some(1024),
        disk_mb: Some(1024),
        max_containers: Some(10),
        prune_interval_ms: 50,
        healthy_monitoring_interval_ms: 20,
        unhealthy_monitoring_interval_ms: 10,
        gateway_retry_interval_ms: 10,
        cache_path: scratch_dir(),
        ..Default::default()
    }
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir()
        .join("cellexec-tests")
        .join(uuid::Uuid::new_v4().to_string())
}

async fn start_with(config: ExecutorConfig) -> (Executor, InMemoryGateway) {
    let gateway = InMemoryGateway::default();
    let executor = Executor::start(&config, Arc::new(gateway.clone()), CancellationToken::new())
        .await
        .unwrap();
    (executor, gateway)
}

async fn start() -> (Executor, InMemoryGateway) {
    start_with(test_config()).await
}

fn spec(guid: &str, memory_mb: i64) -> ContainerSpec {
    ContainerSpec {
        guid: guid.to_string(),
        memory_mb,
        disk_mb: 10,
        ..Default::default()
    }
}

async fn allocate_and_run(executor: &Executor, spec: ContainerSpec) {
    let guid = spec.guid.clone();
    let failed = executor.allocate_containers(vec![spec]).await;
    assert!(failed.is_empty(), "allocation failed: {failed:?}");
    executor.run_container(&guid).await.unwrap();
}

async fn wait_for<F>(executor: &Executor, guid: &str, what: &str, predicate: F) -> Container
where
    F: Fn(&Container) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(container) = executor.get_container(guid).await {
            if predicate(&container) {
                return container;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {guid} to be {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn tar_entries(bytes: &[u8]) -> HashMap<String, String> {
    let mut archive = tar::Archive::new(bytes);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut contents = String::new();
            std::io::Read::read_to_string(&mut entry, &mut contents).unwrap();
            (name, contents)
        })
        .collect()
}

async fn wait_for_state(executor: &Executor, guid: &str, state: ContainerState) -> Container {
    wait_for(executor, guid, &state.to_string(), |c| c.state == state).await
}

#[tokio::test]
async fn test_allocation_failures_are_reported_per_guid() {
    let (executor, _gateway) = start().await;

    let failed = executor
        .allocate_containers(vec![spec("small", 512), spec("huge", 4096), spec("", 10)])
        .await;

    assert_eq!(failed.len(), 2);
    assert_eq!(failed["huge"], ExecutorError::InsufficientResourcesAvailable);
    assert_eq!(failed[""], ExecutorError::GuidNotSpecified);
    assert_eq!(
        executor.get_container("small").await.unwrap().state,
        ContainerState::Reserved
    );
    assert!(executor.get_container("huge").await.is_err());
}

#[tokio::test]
async fn test_duplicate_guid_is_rejected() {
    let (executor, _gateway) = start().await;

    executor.allocate_containers(vec![spec("a", 10)]).await;
    let failed = executor.allocate_containers(vec![spec("a", 10)]).await;

    assert_eq!(failed["a"], ExecutorError::ContainerGuidNotAvailable);
    assert_eq!(executor.remaining_resources().await, ExecutorResources::new(1014, 1014, 9));
}

#[tokio::test]
async fn test_allocate_then_delete_restores_resources() {
    let (executor, _gateway) = start().await;
    let total = executor.total_resources().await;
    assert_eq!(total, ExecutorResources::new(1024, 1024, 10));

    executor
        .allocate_containers(vec![spec("a", 100), spec("b", 200)])
        .await;
    assert_eq!(executor.remaining_resources().await, ExecutorResources::new(724, 1004, 8));

    executor.delete_container("a").await.unwrap();
    executor.delete_container("b").await.unwrap();
    assert_eq!(executor.remaining_resources().await, total);
    assert!(matches!(
        executor.delete_container("a").await,
        Err(ExecutorError::ContainerNotFound)
    ));
}

#[tokio::test]
async fn test_successful_action_completes_with_result_file() {
    let (executor, gateway) = start().await;

    let mut spec = spec("worker", 64);
    spec.action = Some(Action::run("write", &["out/result.txt", "all done"]));
    spec.result_file = Some("out/result.txt".to_string());
    allocate_and_run(&executor, spec).await;

    let container = wait_for_state(&executor, "worker", ContainerState::Completed).await;
    assert!(!container.run_result.failed);
    assert_eq!(container.run_result.result, "all done");
    assert!(gateway.sandbox_exists("worker"));
}

#[tokio::test]
async fn test_events_follow_the_lifecycle_in_order() {
    let (executor, _gateway) = start().await;
    let mut events = executor.subscribe_to_events();

    let mut spec = spec("evented", 64);
    spec.action = Some(Action::run("true", &[]));
    allocate_and_run(&executor, spec).await;

    let mut seen = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .unwrap()
    {
        assert_eq!(event.container().guid, "evented");
        seen.push(event.event_type());
        if event.event_type() == "complete" {
            break;
        }
    }
    assert_eq!(seen, vec!["reserved", "initializing", "created", "running", "complete"]);
}

#[tokio::test]
async fn test_long_running_action_stays_running() {
    let (executor, _gateway) = start().await;

    let mut spec = spec("server", 64);
    spec.action = Some(Action::run("hang", &[]));
    allocate_and_run(&executor, spec).await;

    wait_for_state(&executor, "server", ContainerState::Running).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        executor.get_container("server").await.unwrap().state,
        ContainerState::Running
    );
}

#[tokio::test]
async fn test_unhealthy_monitor_keeps_container_created() {
    let (executor, _gateway) = start().await;

    let mut spec = spec("sick", 64);
    spec.action = Some(Action::run("hang", &[]));
    spec.monitor = Some(Action::run("false", &[]));
    allocate_and_run(&executor, spec).await;

    wait_for_state(&executor, "sick", ContainerState::Created).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        executor.get_container("sick").await.unwrap().state,
        ContainerState::Created
    );
}

#[tokio::test]
async fn test_monitor_failing_after_healthy_completes_container() {
    let (executor, _gateway) = start().await;

    let mut spec = spec("flaky", 64);
    spec.action = Some(Action::run("hang", &[]));
    spec.monitor = Some(Action::run("once", &["healthy-marker"]));
    allocate_and_run(&executor, spec).await;

    let container = wait_for_state(&executor, "flaky", ContainerState::Completed).await;
    assert!(container.run_result.failed);
    assert!(
        container.run_result.failure_reason.starts_with("monitor failed:"),
        "unexpected reason: {}",
        container.run_result.failure_reason
    );
}

#[tokio::test]
async fn test_out_of_memory_stops_the_serial_plan() {
    let (executor, gateway) = start().await;

    let mut spec = spec("greedy", 64);
    spec.action = Some(Action::serial(vec![
        Action::run("oom", &[]),
        Action::run("touch", &["never"]),
    ]));
    allocate_and_run(&executor, spec).await;

    let container = wait_for_state(&executor, "greedy", ContainerState::Completed).await;
    assert!(container.run_result.failed);
    assert_eq!(
        container.run_result.failure_reason,
        "Exited with status 137 (out of memory)"
    );
    assert!(gateway.file("greedy", "never").is_none());
}

#[tokio::test]
async fn test_timed_out_action_fails() {
    let (executor, _gateway) = start().await;

    let mut spec = spec("slow", 64);
    spec.action = Some(Action::timeout(Action::run("hang", &[]), 50));
    allocate_and_run(&executor, spec).await;

    let container = wait_for_state(&executor, "slow", ContainerState::Completed).await;
    assert!(container.run_result.failed);
    assert_eq!(container.run_result.failure_reason, "exceeded 50ms timeout");
}

#[tokio::test]
async fn test_failed_sandbox_creation_completes_container() {
    let (executor, gateway) = start().await;
    gateway.set_fail_creates(true);

    let mut spec = spec("doomed", 64);
    spec.action = Some(Action::run("true", &[]));
    allocate_and_run(&executor, spec).await;

    let container = wait_for_state(&executor, "doomed", ContainerState::Completed).await;
    assert!(container.run_result.failed);
    assert_eq!(container.run_result.failure_reason, "failed to initialize container");
}

#[tokio::test]
async fn test_stop_keeps_sandbox_until_delete() {
    let (executor, gateway) = start().await;

    let mut spec = spec("stoppable", 64);
    spec.action = Some(Action::run("hang", &[]));
    allocate_and_run(&executor, spec).await;
    wait_for_state(&executor, "stoppable", ContainerState::Running).await;

    executor.stop_container("stoppable").await.unwrap();

    let container = executor.get_container("stoppable").await.unwrap();
    assert_eq!(container.state, ContainerState::Completed);
    assert!(container.run_result.stopped);
    assert!(gateway.sandbox_exists("stoppable"));
    assert!(gateway.is_stopped("stoppable"));

    // Stopping twice is harmless
    executor.stop_container("stoppable").await.unwrap();

    executor.delete_container("stoppable").await.unwrap();
    assert!(!gateway.sandbox_exists("stoppable"));
}

#[tokio::test]
async fn test_files_unavailable_before_sandbox_exists() {
    let (executor, _gateway) = start().await;
    executor.allocate_containers(vec![spec("early", 64)]).await;

    assert!(matches!(
        executor.get_files("early", "/tmp").await,
        Err(ExecutorError::ContainerNotReady)
    ));
}

#[tokio::test]
async fn test_vanished_sandbox_is_pruned_and_released() {
    let mut config = test_config();
    config.healthy_monitoring_interval_ms = 60_000;
    let (executor, gateway) = start_with(config).await;

    let mut spec = spec("ghost", 64);
    spec.monitor = Some(Action::run("true", &[]));
    allocate_and_run(&executor, spec).await;
    wait_for_state(&executor, "ghost", ContainerState::Running).await;

    gateway.destroy_out_of_band("ghost");

    let container = wait_for_state(&executor, "ghost", ContainerState::Completed).await;
    assert!(container.run_result.failed);
    assert_eq!(container.run_result.failure_reason, "sandbox disappeared");
    assert_eq!(executor.remaining_resources().await, ExecutorResources::new(1024, 1024, 10));
}

#[tokio::test]
async fn test_shutdown_ends_subscriptions() {
    let (executor, _gateway) = start().await;
    let mut events = executor.subscribe_to_events();

    executor.shutdown().await;

    let next = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_ping_reports_unavailable_runtime() {
    let (executor, gateway) = start().await;
    assert!(executor.ping().await.is_ok());

    gateway.set_available(false);
    assert!(matches!(executor.ping().await, Err(ExecutorError::Gateway(_))));
}

#[tokio::test]
async fn test_api_ping_returns_bad_gateway_when_runtime_is_down() {
    let (executor, gateway) = start().await;
    gateway.set_available(false);

    let response = create_router(executor)
        .oneshot(Request::get("/api/v0/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_api_unknown_container_is_not_found() {
    let (executor, _gateway) = start().await;

    let response = create_router(executor)
        .oneshot(
            Request::get("/api/v0/containers/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_api_allocate_and_list_by_tag() {
    let (executor, _gateway) = start().await;
    let router = create_router(executor);

    let body = serde_json::json!([
        {"guid": "tagged", "memory_mb": 10, "tags": {"app": "web"}},
        {"guid": "plain", "memory_mb": 10},
        {"guid": "too-big", "memory_mb": 100000}
    ]);
    let response = router
        .clone()
        .oneshot(
            Request::post("/api/v0/containers")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let allocation: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        allocation["failed"]["too-big"],
        "insufficient resources available"
    );

    let response = router
        .oneshot(
            Request::get("/api/v0/containers?app=web")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let containers: Vec<Container> = serde_json::from_slice(&body).unwrap();
    let guids: Vec<&str> = containers.iter().map(|c| c.guid.as_str()).collect();
    assert_eq!(guids, vec!["tagged"]);
}

#[tokio::test]
async fn test_tag_filter_is_and() {
    let (executor, _gateway) = start().await;

    let mut a = spec("a", 10);
    a.tags = HashMap::from([("app".to_string(), "web".to_string())]);
    let mut b = spec("b", 10);
    b.tags = HashMap::from([
        ("app".to_string(), "web".to_string()),
        ("tier".to_string(), "front".to_string()),
    ]);
    executor.allocate_containers(vec![a, b]).await;

    let mut filter = Tags::new();
    filter.insert("app".to_string(), "web".to_string());
    assert_eq!(executor.list_containers(&filter).await.len(), 2);

    filter.insert("tier".to_string(), "front".to_string());
    let matched = executor.list_containers(&filter).await;
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].guid, "b");
}

#[tokio::test]
async fn test_startup_resets_cache_dir() {
    let config = test_config();
    std::fs::create_dir_all(config.cache_path.join("stale")).unwrap();
    std::fs::write(config.cache_path.join("stale/blob"), b"old download").unwrap();

    let (_executor, _gateway) = start_with(config.clone()).await;

    assert!(config.cache_path.is_dir());
    assert!(!config.cache_path.join("stale").exists());
}

#[tokio::test]
async fn test_action_failure_completes_healthy_container() {
    let (executor, _gateway) = start().await;

    let mut spec = spec("crashy", 64);
    spec.action = Some(Action::serial(vec![
        Action::run("sleep", &["0.1"]),
        Action::run("exit", &["3"]),
    ]));
    spec.monitor = Some(Action::run("true", &[]));
    allocate_and_run(&executor, spec).await;

    wait_for_state(&executor, "crashy", ContainerState::Running).await;
    let container = wait_for_state(&executor, "crashy", ContainerState::Completed).await;
    assert!(container.run_result.failed);
    assert_eq!(container.run_result.failure_reason, "Exited with status 3");
}

#[tokio::test]
async fn test_daemonised_action_keeps_monitored_container_running() {
    let (executor, _gateway) = start().await;

    let mut spec = spec("daemon", 64);
    spec.action = Some(Action::run("true", &[]));
    spec.monitor = Some(Action::run("true", &[]));
    allocate_and_run(&executor, spec).await;

    wait_for_state(&executor, "daemon", ContainerState::Running).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        executor.get_container("daemon").await.unwrap().state,
        ContainerState::Running
    );
}

#[tokio::test]
async fn test_sandbox_gets_limits_and_container_env() {
    let (executor, gateway) = start().await;

    let mut spec = spec("limited", 64);
    spec.cpu_weight = 50;
    spec.env = vec![EnvironmentVariable::new("GREETING", "hello")];
    spec.action = Some(Action::run("hang", &[]));
    allocate_and_run(&executor, spec).await;
    wait_for_state(&executor, "limited", ContainerState::Running).await;

    assert_eq!(gateway.sandbox_limits("limited"), Some((64 * 1024 * 1024, 512)));
    assert!(gateway
        .sandbox_env("limited")
        .contains(&EnvironmentVariable::new("GREETING", "hello")));
    let processes = gateway.processes("limited");
    assert!(processes[0]
        .env
        .contains(&EnvironmentVariable::new("GREETING", "hello")));
}

#[tokio::test]
async fn test_network_env_exported_to_processes() {
    let mut config = test_config();
    config.export_network_env_vars = true;
    let (executor, gateway) = start_with(config).await;

    let mut spec = spec("networked", 64);
    spec.ports = vec![PortMapping {
        container_port: 8080,
        host_port: 0,
    }];
    spec.action = Some(Action::run("hang", &[]));
    allocate_and_run(&executor, spec).await;

    let container = wait_for_state(&executor, "networked", ContainerState::Running).await;
    let host_port = container.ports[0].host_port;
    assert_ne!(host_port, 0);
    assert_eq!(container.external_ip, "127.0.0.1");

    let env = &gateway.processes("networked")[0].env;
    assert!(env.contains(&EnvironmentVariable::new("INSTANCE_IP", "127.0.0.1")));
    assert!(env.contains(&EnvironmentVariable::new(
        "INSTANCE_ADDR",
        format!("127.0.0.1:{host_port}")
    )));
    assert!(env.contains(&EnvironmentVariable::new(
        "INSTANCE_PORTS",
        format!(r#"[{{"external":{host_port},"internal":8080}}]"#)
    )));
}

#[tokio::test]
async fn test_network_env_not_exported_by_default() {
    let (executor, gateway) = start().await;

    let mut spec = spec("quiet", 64);
    spec.action = Some(Action::run("hang", &[]));
    allocate_and_run(&executor, spec).await;
    wait_for_state(&executor, "quiet", ContainerState::Running).await;

    assert!(gateway.processes("quiet")[0]
        .env
        .iter()
        .all(|var| !var.name.starts_with("INSTANCE_")));
}

#[tokio::test]
async fn test_get_files_streams_sandbox_contents() {
    let (executor, _gateway) = start().await;

    let mut spec = spec("producer", 64);
    spec.action = Some(Action::run("write", &["out/report.txt", "42 widgets"]));
    allocate_and_run(&executor, spec).await;
    wait_for_state(&executor, "producer", ContainerState::Completed).await;

    let mut stream = executor.get_files("producer", "out").await.unwrap();
    let mut tar = Vec::new();
    while let Some(chunk) = stream.next().await {
        tar.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(tar_entries(&tar)["out/report.txt"], "42 widgets");

    let response = create_router(executor)
        .oneshot(
            Request::get("/api/v0/containers/producer/files?path=out/report.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-tar");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(tar_entries(&body)["report.txt"], "42 widgets");
}

#[tokio::test]
async fn test_deleting_running_container_publishes_nothing_more() {
    let (executor, gateway) = start().await;
    let mut events = executor.subscribe_to_events();

    let mut spec = spec("doomed-runner", 64);
    spec.action = Some(Action::run("hang", &[]));
    allocate_and_run(&executor, spec).await;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        if event.event_type() == "running" {
            break;
        }
    }

    executor.delete_container("doomed-runner").await.unwrap();
    assert!(!gateway.sandbox_exists("doomed-runner"));

    let late = tokio::time::timeout(Duration::from_millis(200), events.next()).await;
    assert!(late.is_err(), "unexpected event after delete: {late:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_right_after_run_leaves_no_sandbox() {
    let mut config = test_config();
    config.max_containers = Some(1000);
    let (executor, gateway) = start_with(config).await;

    let guids: Vec<String> = (0..200).map(|i| format!("short-lived-{i}")).collect();
    for guid in &guids {
        let mut spec = spec(guid, 1);
        spec.action = Some(Action::run("hang", &[]));
        allocate_and_run(&executor, spec).await;
        executor.delete_container(guid).await.unwrap();
    }

    // Let every supervisor reach a decision about its sandbox
    tokio::time::sleep(Duration::from_millis(200)).await;

    let leaked: Vec<&String> = guids.iter().filter(|g| gateway.sandbox_exists(g)).collect();
    assert!(leaked.is_empty(), "sandboxes outlived their containers: {leaked:?}");
}

#[tokio::test]
async fn test_run_refused_after_shutdown() {
    let (executor, gateway) = start().await;
    let mut spec = spec("late", 64);
    spec.action = Some(Action::run("hang", &[]));
    executor.allocate_containers(vec![spec]).await;

    executor.shutdown().await;

    assert_eq!(
        executor.run_container("late").await,
        Err(ExecutorError::ShuttingDown)
    );
    assert_eq!(
        executor.get_container("late").await.unwrap().state,
        ContainerState::Reserved
    );
    assert!(!gateway.sandbox_exists("late"));
}
