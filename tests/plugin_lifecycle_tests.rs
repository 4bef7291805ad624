//! Integration tests for the plugin lifecycle
//!
//! Each test runs a plugin against an in-process fake piped and drives it
//! through startup, serving and shutdown.

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use piped_plugin_sdk::client::ReportStageLogsRequest;
use piped_plugin_sdk::plugin::*;
use piped_plugin_sdk::rpc::{JsonRpcRequest, JsonRpcResponse};
use piped_plugin_sdk::{Error, StartOptions};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExampleConfig {
    greeting: String,
}

#[derive(Debug, Deserialize)]
struct TargetConfig {
    region: String,
}

#[derive(Debug, Deserialize)]
struct AppSpec {
    replicas: u32,
}

type ExamplePlugin = Plugin<ExampleConfig, TargetConfig, AppSpec>;

#[derive(Default)]
struct Example {
    initialized: AtomicUsize,
    seen_targets: Mutex<Vec<String>>,
    fail_init: bool,
}

#[async_trait]
impl Initializer<ExampleConfig, TargetConfig> for Example {
    async fn initialize(&self, input: &InitializeInput<ExampleConfig, TargetConfig>) -> anyhow::Result<()> {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            anyhow::bail!("cannot reach the cluster");
        }
        let mut targets: Vec<String> = input
            .deploy_targets
            .values()
            .map(|dt| format!("{}={}", dt.name, dt.config.region))
            .collect();
        targets.sort();
        *self.seen_targets.lock().unwrap() = targets;
        Ok(())
    }
}

#[async_trait]
impl DeploymentPlugin<ExampleConfig, TargetConfig, AppSpec> for Example {
    fn fetch_defined_stages(&self) -> Vec<String> {
        vec!["EXAMPLE_SYNC".to_string(), "EXAMPLE_ROLLBACK".to_string()]
    }

    async fn determine_versions(
        &self,
        _config: Option<&ExampleConfig>,
        _input: DetermineVersionsInput<AppSpec>,
    ) -> anyhow::Result<DetermineVersionsResponse> {
        Ok(DetermineVersionsResponse::default())
    }

    async fn determine_strategy(
        &self,
        _config: Option<&ExampleConfig>,
        _input: DetermineStrategyInput<AppSpec>,
    ) -> anyhow::Result<Option<DetermineStrategyResponse>> {
        Ok(Some(DetermineStrategyResponse {
            strategy: SyncStrategy::QuickSync,
            summary: "quick sync".to_string(),
        }))
    }

    async fn build_pipeline_sync_stages(
        &self,
        _config: Option<&ExampleConfig>,
        _input: BuildPipelineSyncStagesInput,
    ) -> anyhow::Result<BuildPipelineSyncStagesResponse> {
        Ok(BuildPipelineSyncStagesResponse { stages: vec![] })
    }

    async fn build_quick_sync_stages(
        &self,
        _config: Option<&ExampleConfig>,
        _input: BuildQuickSyncStagesInput,
    ) -> anyhow::Result<BuildQuickSyncStagesResponse> {
        Ok(BuildQuickSyncStagesResponse::default())
    }

    async fn execute_stage(
        &self,
        config: Option<&ExampleConfig>,
        deploy_targets: &[Arc<DeployTarget<TargetConfig>>],
        input: ExecuteStageInput<AppSpec>,
    ) -> anyhow::Result<ExecuteStageResponse> {
        let greeting = config.map(|c| c.greeting.as_str()).unwrap_or("hello");
        for target in deploy_targets {
            input.client.log_persister().info(&format!(
                "{}: {} replicas in {}",
                greeting,
                input.request.target_deployment_source.application_config.spec.replicas,
                target.config.region
            ));
        }
        Ok(ExecuteStageResponse {
            status: StageStatus::Success,
        })
    }

    fn initializer(&self) -> Option<&dyn Initializer<ExampleConfig, TargetConfig>> {
        Some(self)
    }
}

#[async_trait]
impl LivestatePlugin<ExampleConfig, TargetConfig, AppSpec> for Example {
    async fn get_livestate(
        &self,
        _config: Option<&ExampleConfig>,
        deploy_targets: &[Arc<DeployTarget<TargetConfig>>],
        _input: GetLivestateInput<AppSpec>,
    ) -> anyhow::Result<GetLivestateResponse> {
        Ok(GetLivestateResponse {
            live_state: ApplicationLiveState {
                resources: deploy_targets
                    .iter()
                    .map(|dt| ResourceState {
                        id: format!("{}-deployment", dt.name),
                        name: "deployment".to_string(),
                        resource_type: "Deployment".to_string(),
                        parent_ids: vec![],
                        health_status: HealthStatus::Healthy,
                        health_description: String::new(),
                        deploy_target: dt.name.clone(),
                    })
                    .collect(),
                health_status: HealthStatus::Healthy,
            },
            sync_state: ApplicationSyncState {
                status: ApplicationSyncStatus::Synced,
                short_reason: String::new(),
                reason: String::new(),
            },
        })
    }

    fn initializer(&self) -> Option<&dyn Initializer<ExampleConfig, TargetConfig>> {
        Some(self)
    }
}

#[derive(Clone, Default)]
struct FakePiped {
    reports: Arc<Mutex<Vec<ReportStageLogsRequest>>>,
}

impl FakePiped {
    fn logs(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .flat_map(|r| r.blocks.iter().map(|b| b.log.clone()))
            .collect()
    }
}

async fn start_fake_piped() -> (String, FakePiped) {
    async fn handle(State(piped): State<FakePiped>, Json(req): Json<JsonRpcRequest>) -> Json<JsonRpcResponse> {
        if req.method == "PluginService/ReportStageLogs" {
            let report: ReportStageLogsRequest =
                serde_json::from_value(req.params.unwrap_or(Value::Null)).unwrap();
            piped.reports.lock().unwrap().push(report);
        }
        Json(JsonRpcResponse::success(req.id, json!({})))
    }

    let piped = FakePiped::default();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/rpc", post(handle))
        .with_state(piped.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr.to_string(), piped)
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_config(config: Value) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(config.to_string().as_bytes()).unwrap();
    file
}

fn build(example: Arc<Example>) -> ExamplePlugin {
    ExamplePlugin::builder("v0.1.0")
        .with_deployment_plugin(example.clone())
        .with_livestate_plugin(example)
        .build()
        .unwrap()
}

fn options(piped: &str, config: &tempfile::NamedTempFile) -> StartOptions {
    StartOptions::new(piped, config.path()).with_grace_period(Duration::from_secs(5))
}

async fn wait_for_state(
    receiver: &mut watch::Receiver<LifecycleState>,
    state: LifecycleState,
) -> LifecycleState {
    let observed = tokio::time::timeout(
        Duration::from_secs(10),
        receiver.wait_for(|s| *s == state || s.is_terminal()),
    )
    .await
    .expect("timed out waiting for lifecycle state")
    .expect("state channel closed");
    *observed
}

async fn call_rpc(port: u16, method: &str, params: Value) -> JsonRpcResponse {
    let client = reqwest::Client::new();
    let body = JsonRpcRequest::new(method, Some(params), Some(json!(1)));
    for _ in 0..50 {
        match client
            .post(format!("http://127.0.0.1:{}/rpc", port))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => return response.json().await.unwrap(),
            // the server task may not have bound yet
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("rpc server on port {} never answered", port);
}

async fn http_get(port: u16, path: &str) -> String {
    for _ in 0..50 {
        match reqwest::get(format!("http://127.0.0.1:{}{}", port, path)).await {
            Ok(response) => return response.text().await.unwrap(),
            // the admin task may not have bound yet
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("admin server on port {} never answered", port);
}

#[tokio::test]
async fn test_serving_and_graceful_shutdown() {
    let (piped_addr, piped) = start_fake_piped().await;
    let port = free_port();
    let config = write_config(json!({
        "name": "example",
        "port": port,
        "config": {"greeting": "hi"},
        "deployTargets": [
            {"name": "tokyo", "config": {"region": "ap-northeast-1"}},
            {"name": "oregon", "config": {"region": "us-west-2"}}
        ]
    }));

    let admin_port = free_port();

    let example = Arc::new(Example::default());
    let plugin = Arc::new(build(example.clone()));
    let mut states = plugin.subscribe_state();
    let shutdown = CancellationToken::new();

    let handle = {
        let plugin = plugin.clone();
        let options = options(&piped_addr, &config).with_admin_port(admin_port);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { plugin.start(options, shutdown).await })
    };

    assert_eq!(
        wait_for_state(&mut states, LifecycleState::Serving).await,
        LifecycleState::Serving
    );
    // the management endpoint runs next to the rpc server
    assert_eq!(http_get(admin_port, "/healthz").await, "ok");
    assert_eq!(http_get(admin_port, "/version").await, "v0.1.0");
    // one instance registered as deployment and livestate is initialized twice
    assert_eq!(example.initialized.load(Ordering::SeqCst), 2);
    assert_eq!(
        *example.seen_targets.lock().unwrap(),
        vec!["oregon=us-west-2", "tokyo=ap-northeast-1"]
    );

    let stages = call_rpc(port, "DeploymentService/FetchDefinedStages", json!({})).await;
    assert_eq!(
        stages.result.unwrap(),
        json!({"stages": ["EXAMPLE_SYNC", "EXAMPLE_ROLLBACK"]})
    );

    let executed = call_rpc(
        port,
        "DeploymentService/ExecuteStage",
        json!({
            "stageName": "EXAMPLE_SYNC",
            "stageId": "stage-1",
            "deployment": {"id": "d-1", "applicationId": "app-1", "deployTargets": ["tokyo"]},
            "targetDeploymentSource": {
                "applicationDirectory": "/app",
                "applicationConfig": {"spec": {"replicas": 2}}
            }
        }),
    )
    .await;
    assert_eq!(executed.result.unwrap(), json!({"status": "SUCCESS"}));

    let livestate = call_rpc(
        port,
        "LivestateService/GetLivestate",
        json!({
            "pipedId": "piped-1",
            "applicationId": "app-1",
            "deployTargets": ["oregon"],
            "deploymentSource": {
                "applicationDirectory": "/app",
                "applicationConfig": {"spec": {"replicas": 2}}
            }
        }),
    )
    .await;
    let livestate = livestate.result.unwrap();
    assert_eq!(livestate["liveState"]["resources"][0]["deployTarget"], "oregon");
    assert_eq!(livestate["syncState"]["status"], "SYNCED");

    let unknown = call_rpc(port, "PlanPreviewService/GetPlanPreview", json!({})).await;
    assert_eq!(unknown.error.unwrap().code, -32601);

    shutdown.cancel();
    tokio_test::assert_ok!(handle.await.unwrap());
    assert_eq!(plugin.state(), LifecycleState::Terminated);
    assert_eq!(piped.logs(), vec!["hi: 2 replicas in ap-northeast-1"]);
}

#[tokio::test]
async fn test_plugin_config_decode_failure_skips_initializers() {
    let (piped_addr, _piped) = start_fake_piped().await;
    let config = write_config(json!({
        "name": "example",
        "port": free_port(),
        "config": {"greeting": 42}
    }));

    let example = Arc::new(Example::default());
    let plugin = build(example.clone());
    let result = plugin
        .start(options(&piped_addr, &config), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Config(_))));
    assert_eq!(example.initialized.load(Ordering::SeqCst), 0);
    assert_eq!(plugin.state(), LifecycleState::Failed);
}

#[tokio::test]
async fn test_deploy_target_decode_failure_aborts_startup() {
    let (piped_addr, _piped) = start_fake_piped().await;
    let config = write_config(json!({
        "name": "example",
        "port": free_port(),
        "deployTargets": [
            {"name": "tokyo", "config": {"region": "ap-northeast-1"}},
            {"name": "broken", "config": {"zone": "a"}}
        ]
    }));

    let example = Arc::new(Example::default());
    let plugin = build(example.clone());
    let err = plugin
        .start(options(&piped_addr, &config), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::Config(message) => assert!(message.contains("broken")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(example.initialized.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_initializer_failure_aborts_before_serving() {
    let (piped_addr, _piped) = start_fake_piped().await;
    let port = free_port();
    let config = write_config(json!({"name": "example", "port": port}));

    let example = Arc::new(Example {
        fail_init: true,
        ..Default::default()
    });
    let plugin = build(example.clone());
    let mut states = plugin.subscribe_state();
    let err = plugin
        .start(options(&piped_addr, &config), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Initialization { role: "deployment", .. }));
    // the livestate role is never reached
    assert_eq!(example.initialized.load(Ordering::SeqCst), 1);
    assert_eq!(*states.borrow_and_update(), LifecycleState::Failed);
    // nothing was bound
    assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[tokio::test]
async fn test_unreachable_piped_is_connection_error() {
    let config = write_config(json!({"name": "example", "port": free_port()}));
    let example = Arc::new(Example::default());
    let plugin = build(example.clone());

    let err = plugin
        .start(
            options(&format!("127.0.0.1:{}", free_port()), &config),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Connection { .. }));
    assert_eq!(example.initialized.load(Ordering::SeqCst), 0);
    assert_eq!(plugin.state(), LifecycleState::Failed);
}

#[tokio::test]
async fn test_subsystem_failure_stops_the_plugin() {
    let (piped_addr, _piped) = start_fake_piped().await;
    // hold the port so the rpc server cannot bind it
    let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let config = write_config(json!({"name": "example", "port": port}));

    let plugin = build(Arc::new(Example::default()));
    let shutdown = CancellationToken::new();
    let err = tokio::time::timeout(
        Duration::from_secs(10),
        plugin.start(options(&piped_addr, &config), shutdown.clone()),
    )
    .await
    .expect("plugin did not stop after a subsystem failure")
    .unwrap_err();

    assert!(matches!(err, Error::Subsystem { name: "rpc-server", .. }));
    assert!(shutdown.is_cancelled());
    assert_eq!(plugin.state(), LifecycleState::Failed);
    drop(occupied);
}

#[tokio::test]
async fn test_duplicate_deploy_targets_keep_the_last_entry() {
    let (piped_addr, _piped) = start_fake_piped().await;
    let config = write_config(json!({
        "name": "example",
        "port": free_port(),
        "deployTargets": [
            {"name": "tokyo", "config": {"region": "first"}},
            {"name": "tokyo", "config": {"region": "second"}}
        ]
    }));

    let example = Arc::new(Example::default());
    let plugin = Arc::new(build(example.clone()));
    let mut states = plugin.subscribe_state();
    let shutdown = CancellationToken::new();
    let handle = {
        let plugin = plugin.clone();
        let options = options(&piped_addr, &config);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { plugin.start(options, shutdown).await })
    };

    wait_for_state(&mut states, LifecycleState::Serving).await;
    assert_eq!(*example.seen_targets.lock().unwrap(), vec!["tokyo=second"]);

    shutdown.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_tls_without_certificate_is_rejected() {
    let (piped_addr, _piped) = start_fake_piped().await;
    let config = write_config(json!({"name": "example", "port": free_port()}));
    let plugin = build(Arc::new(Example::default()));

    let mut options = options(&piped_addr, &config);
    options.tls = true;
    let err = plugin
        .start(options, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_registration_is_validated() {
    let example = Arc::new(Example::default());
    assert!(matches!(
        ExamplePlugin::builder("v0.1.0").build(),
        Err(Error::Configuration(_))
    ));
    assert!(ExamplePlugin::builder("v0.1.0")
        .with_livestate_plugin(example)
        .build()
        .is_ok());
}
