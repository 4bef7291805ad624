//! Role adapters exposing registered plugins as RPC services.
//!
//! Each adapter decodes the request into the plugin's typed input, resolves
//! deploy target names against the shared table, calls the plugin and encodes
//! its answer. Stage and deployment plugins are both served as
//! `DeploymentService`, which is the service piped calls for stage execution.

use super::client::Client;
use super::common::CommonFields;
use super::roles::{DeploymentPlugin, LivestatePlugin, PlanPreviewPlugin, StagePlugin};
use super::types::*;
use crate::logpersister::StageLogPersister;
use crate::rpc::{CallContext, RpcError, Service};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{info_span, Span};
use validator::Validate;

pub const DEPLOYMENT_SERVICE: &str = "DeploymentService";
pub const LIVESTATE_SERVICE: &str = "LivestateService";
pub const PLAN_PREVIEW_SERVICE: &str = "PlanPreviewService";

const DEPLOYMENT_METHODS: &[&str] = &[
    "FetchDefinedStages",
    "DetermineVersions",
    "DetermineStrategy",
    "BuildPipelineSyncStages",
    "BuildQuickSyncStages",
    "ExecuteStage",
];
const LIVESTATE_METHODS: &[&str] = &["GetLivestate"];
const PLAN_PREVIEW_METHODS: &[&str] = &["GetPlanPreview"];

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    Ok(serde_json::from_value(params)?)
}

fn check<V: Validate>(value: &V) -> Result<(), RpcError> {
    value
        .validate()
        .map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Internal(e.to_string()))
}

fn resolve_deploy_targets<D>(
    table: &DeployTargetTable<D>,
    names: &[String],
) -> Result<Vec<Arc<DeployTarget<D>>>, RpcError> {
    names
        .iter()
        .map(|name| {
            table
                .get(name)
                .cloned()
                .ok_or_else(|| RpcError::InvalidParams(format!("deploy target {} not found", name)))
        })
        .collect()
}

/// Run a plugin call, giving up when the call context is cancelled.
async fn invoke<T, F>(ctx: &CallContext, call: F) -> Result<T, RpcError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancellation().cancelled() => Err(RpcError::Cancelled),
        result = call => result.map_err(|e| RpcError::Internal(format!("{:#}", e))),
    }
}

struct PreparedStage<D, A> {
    deploy_targets: Vec<Arc<DeployTarget<D>>>,
    input: ExecuteStageInput<A>,
    stage_log: Arc<dyn StageLogPersister>,
}

fn prepare_execute_stage<C, D, A>(
    common: &CommonFields<C, D>,
    params: Value,
) -> Result<PreparedStage<D, A>, RpcError>
where
    A: DeserializeOwned,
{
    let request: ExecuteStageRequest<A> = decode(params)?;
    if request.stage_name.is_empty() {
        return Err(RpcError::InvalidParams("stageName must not be empty".to_string()));
    }
    check(&request.deployment)?;

    let deploy_targets =
        resolve_deploy_targets(&common.deploy_targets, &request.deployment.deploy_targets)?;
    let stage_log = common
        .log_persister
        .stage_log_persister(&request.deployment.id, &request.stage_id);
    let logger = info_span!(
        parent: &common.logger,
        "execute-stage",
        stage = %request.stage_name,
        deployment_id = %request.deployment.id
    );

    Ok(PreparedStage {
        deploy_targets,
        input: ExecuteStageInput {
            request,
            client: Client::new(stage_log.clone(), common.tool_registry.clone()),
            logger,
        },
        stage_log,
    })
}

fn method_logger(common_logger: &Span, method: &'static str) -> Span {
    info_span!(parent: common_logger, "rpc", method)
}

/// Serves a [`StagePlugin`]
pub struct StagePluginService<C, D, A> {
    base: Arc<dyn StagePlugin<C, D, A>>,
    common: CommonFields<C, D>,
}

impl<C, D, A> StagePluginService<C, D, A> {
    pub fn new(base: Arc<dyn StagePlugin<C, D, A>>, common: CommonFields<C, D>) -> Self {
        Self { base, common }
    }
}

#[async_trait]
impl<C, D, A> Service for StagePluginService<C, D, A>
where
    C: DeserializeOwned + Send + Sync + 'static,
    D: DeserializeOwned + Send + Sync + 'static,
    A: DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        DEPLOYMENT_SERVICE
    }

    fn methods(&self) -> &'static [&'static str] {
        DEPLOYMENT_METHODS
    }

    async fn call(&self, ctx: CallContext, method: &str, params: Value) -> Result<Value, RpcError> {
        let config = self.common.plugin_config();
        match method {
            "FetchDefinedStages" => encode(&FetchDefinedStagesResponse {
                stages: self.base.fetch_defined_stages(),
            }),
            "BuildPipelineSyncStages" => {
                let request: BuildPipelineSyncStagesRequest = decode(params)?;
                check(&request)?;
                let input = BuildPipelineSyncStagesInput {
                    request,
                    logger: method_logger(&self.common.logger, "BuildPipelineSyncStages"),
                };
                let response = invoke(&ctx, self.base.build_pipeline_sync_stages(config, input)).await?;
                encode(&response)
            }
            "ExecuteStage" => {
                let prepared = prepare_execute_stage::<C, D, A>(&self.common, params)?;
                let result = invoke(
                    &ctx,
                    self.base
                        .execute_stage(config, &prepared.deploy_targets, prepared.input),
                )
                .await;
                prepared.stage_log.complete();
                encode(&result?)
            }
            // a stage plugin does not own deployments; answer with neutral defaults
            "DetermineVersions" => encode(&DetermineVersionsResponse::default()),
            "DetermineStrategy" => Ok(Value::Null),
            "BuildQuickSyncStages" => encode(&BuildQuickSyncStagesResponse::default()),
            other => Err(RpcError::MethodNotFound(format!("{}/{}", DEPLOYMENT_SERVICE, other))),
        }
    }
}

/// Serves a [`DeploymentPlugin`]
pub struct DeploymentPluginService<C, D, A> {
    base: Arc<dyn DeploymentPlugin<C, D, A>>,
    common: CommonFields<C, D>,
}

impl<C, D, A> DeploymentPluginService<C, D, A> {
    pub fn new(base: Arc<dyn DeploymentPlugin<C, D, A>>, common: CommonFields<C, D>) -> Self {
        Self { base, common }
    }
}

#[async_trait]
impl<C, D, A> Service for DeploymentPluginService<C, D, A>
where
    C: DeserializeOwned + Send + Sync + 'static,
    D: DeserializeOwned + Send + Sync + 'static,
    A: DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        DEPLOYMENT_SERVICE
    }

    fn methods(&self) -> &'static [&'static str] {
        DEPLOYMENT_METHODS
    }

    async fn call(&self, ctx: CallContext, method: &str, params: Value) -> Result<Value, RpcError> {
        let config = self.common.plugin_config();
        match method {
            "FetchDefinedStages" => encode(&FetchDefinedStagesResponse {
                stages: self.base.fetch_defined_stages(),
            }),
            "DetermineVersions" => {
                let request: DetermineVersionsRequest<A> = decode(params)?;
                check(&request.deployment)?;
                let input = DetermineVersionsInput {
                    request,
                    logger: method_logger(&self.common.logger, "DetermineVersions"),
                };
                let response = invoke(&ctx, self.base.determine_versions(config, input)).await?;
                encode(&response)
            }
            "DetermineStrategy" => {
                let request: DetermineStrategyRequest<A> = decode(params)?;
                check(&request.deployment)?;
                let input = DetermineStrategyInput {
                    request,
                    logger: method_logger(&self.common.logger, "DetermineStrategy"),
                };
                let response = invoke(&ctx, self.base.determine_strategy(config, input)).await?;
                encode(&response)
            }
            "BuildPipelineSyncStages" => {
                let request: BuildPipelineSyncStagesRequest = decode(params)?;
                check(&request)?;
                let input = BuildPipelineSyncStagesInput {
                    request,
                    logger: method_logger(&self.common.logger, "BuildPipelineSyncStages"),
                };
                let response = invoke(&ctx, self.base.build_pipeline_sync_stages(config, input)).await?;
                encode(&response)
            }
            "BuildQuickSyncStages" => {
                let request: BuildQuickSyncStagesRequest = decode(params)?;
                let input = BuildQuickSyncStagesInput {
                    request,
                    logger: method_logger(&self.common.logger, "BuildQuickSyncStages"),
                };
                let response = invoke(&ctx, self.base.build_quick_sync_stages(config, input)).await?;
                encode(&response)
            }
            "ExecuteStage" => {
                let prepared = prepare_execute_stage::<C, D, A>(&self.common, params)?;
                let result = invoke(
                    &ctx,
                    self.base
                        .execute_stage(config, &prepared.deploy_targets, prepared.input),
                )
                .await;
                prepared.stage_log.complete();
                encode(&result?)
            }
            other => Err(RpcError::MethodNotFound(format!("{}/{}", DEPLOYMENT_SERVICE, other))),
        }
    }
}

/// Serves a [`LivestatePlugin`]
pub struct LivestatePluginService<C, D, A> {
    base: Arc<dyn LivestatePlugin<C, D, A>>,
    common: CommonFields<C, D>,
}

impl<C, D, A> LivestatePluginService<C, D, A> {
    pub fn new(base: Arc<dyn LivestatePlugin<C, D, A>>, common: CommonFields<C, D>) -> Self {
        Self { base, common }
    }
}

#[async_trait]
impl<C, D, A> Service for LivestatePluginService<C, D, A>
where
    C: DeserializeOwned + Send + Sync + 'static,
    D: DeserializeOwned + Send + Sync + 'static,
    A: DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        LIVESTATE_SERVICE
    }

    fn methods(&self) -> &'static [&'static str] {
        LIVESTATE_METHODS
    }

    async fn call(&self, ctx: CallContext, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "GetLivestate" => {
                let request: GetLivestateRequest<A> = decode(params)?;
                let deploy_targets =
                    resolve_deploy_targets(&self.common.deploy_targets, &request.deploy_targets)?;
                let input = GetLivestateInput {
                    request,
                    logger: method_logger(&self.common.logger, "GetLivestate"),
                };
                let response = invoke(
                    &ctx,
                    self.base
                        .get_livestate(self.common.plugin_config(), &deploy_targets, input),
                )
                .await?;
                encode(&response)
            }
            other => Err(RpcError::MethodNotFound(format!("{}/{}", LIVESTATE_SERVICE, other))),
        }
    }
}

/// Serves a [`PlanPreviewPlugin`]
pub struct PlanPreviewPluginService<C, D, A> {
    base: Arc<dyn PlanPreviewPlugin<C, D, A>>,
    common: CommonFields<C, D>,
}

impl<C, D, A> PlanPreviewPluginService<C, D, A> {
    pub fn new(base: Arc<dyn PlanPreviewPlugin<C, D, A>>, common: CommonFields<C, D>) -> Self {
        Self { base, common }
    }
}

#[async_trait]
impl<C, D, A> Service for PlanPreviewPluginService<C, D, A>
where
    C: DeserializeOwned + Send + Sync + 'static,
    D: DeserializeOwned + Send + Sync + 'static,
    A: DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        PLAN_PREVIEW_SERVICE
    }

    fn methods(&self) -> &'static [&'static str] {
        PLAN_PREVIEW_METHODS
    }

    async fn call(&self, ctx: CallContext, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "GetPlanPreview" => {
                let request: GetPlanPreviewRequest<A> = decode(params)?;
                let deploy_targets =
                    resolve_deploy_targets(&self.common.deploy_targets, &request.deploy_targets)?;
                let input = GetPlanPreviewInput {
                    request,
                    logger: method_logger(&self.common.logger, "GetPlanPreview"),
                };
                let response = invoke(
                    &ctx,
                    self.base
                        .get_plan_preview(self.common.plugin_config(), &deploy_targets, input),
                )
                .await?;
                encode(&response)
            }
            other => Err(RpcError::MethodNotFound(format!("{}/{}", PLAN_PREVIEW_SERVICE, other))),
        }
    }
}
