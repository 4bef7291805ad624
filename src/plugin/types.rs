//! Request and response shapes exchanged with piped, plus deploy target helpers.
//!
//! Requests are generic over the application config spec `A`; it is decoded
//! straight from the request payload so plugins only ever see typed data.

use super::client::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Span;
use validator::Validate;

/// A named destination the plugin deploys to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployTarget<D> {
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    pub config: D,
}

/// Deploy targets by name, shared read-only by every role
pub type DeployTargetTable<D> = Arc<HashMap<String, Arc<DeployTarget<D>>>>;

/// Config shape for plugins that do not read their config.
///
/// Accepts any JSON object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigNone {}

/// Deploy targets for plugins that do not use deploy target config
pub type DeployTargetsNone = Vec<Arc<DeployTarget<ConfigNone>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    pub application_id: String,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub piped_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub trigger: Option<DeploymentTrigger>,
    /// Names of the deploy targets this deployment acts on
    #[serde(default)]
    pub deploy_targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTrigger {
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub commander: String,
}

/// A checked out application at one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSource<A> {
    pub application_directory: String,
    #[serde(default)]
    pub commit_hash: String,
    pub application_config: ApplicationConfig<A>,
    #[serde(default)]
    pub application_config_filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig<A> {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: A,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub index: u32,
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Success,
    Failure,
    Cancelled,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStrategy {
    QuickSync,
    PipelineSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchDefinedStagesResponse {
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BuildPipelineSyncStagesRequest {
    #[validate(nested)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub rollback: bool,
}

pub struct BuildPipelineSyncStagesInput {
    pub request: BuildPipelineSyncStagesRequest,
    pub logger: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPipelineSyncStagesResponse {
    pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteStageRequest<A> {
    pub stage_name: String,
    #[serde(default)]
    pub stage_config: Value,
    #[serde(default)]
    pub stage_id: String,
    pub deployment: Deployment,
    pub running_deployment_source: Option<DeploymentSource<A>>,
    pub target_deployment_source: DeploymentSource<A>,
}

pub struct ExecuteStageInput<A> {
    pub request: ExecuteStageRequest<A>,
    /// Per-stage log persister and tool registry
    pub client: Client,
    pub logger: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteStageResponse {
    pub status: StageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetermineVersionsRequest<A> {
    pub deployment: Deployment,
    pub deployment_source: DeploymentSource<A>,
}

pub struct DetermineVersionsInput<A> {
    pub request: DetermineVersionsRequest<A>,
    pub logger: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactVersion {
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetermineVersionsResponse {
    pub versions: Vec<ArtifactVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetermineStrategyRequest<A> {
    pub deployment: Deployment,
    pub running_deployment_source: Option<DeploymentSource<A>>,
    pub target_deployment_source: DeploymentSource<A>,
}

pub struct DetermineStrategyInput<A> {
    pub request: DetermineStrategyRequest<A>,
    pub logger: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetermineStrategyResponse {
    pub strategy: SyncStrategy,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildQuickSyncStagesRequest {
    #[serde(default)]
    pub rollback: bool,
}

pub struct BuildQuickSyncStagesInput {
    pub request: BuildQuickSyncStagesRequest,
    pub logger: Span,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildQuickSyncStagesResponse {
    pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLivestateRequest<A> {
    pub piped_id: String,
    pub application_id: String,
    #[serde(default)]
    pub deploy_targets: Vec<String>,
    pub deployment_source: DeploymentSource<A>,
}

pub struct GetLivestateInput<A> {
    pub request: GetLivestateRequest<A>,
    pub logger: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub id: String,
    pub name: String,
    pub resource_type: String,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub health_description: String,
    #[serde(default)]
    pub deploy_target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationLiveState {
    pub resources: Vec<ResourceState>,
    #[serde(default)]
    pub health_status: HealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationSyncStatus {
    #[default]
    Unknown,
    Synced,
    Deploying,
    OutOfSync,
    InvalidConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSyncState {
    pub status: ApplicationSyncStatus,
    #[serde(default)]
    pub short_reason: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLivestateResponse {
    pub live_state: ApplicationLiveState,
    pub sync_state: ApplicationSyncState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPlanPreviewRequest<A> {
    pub application_id: String,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub deploy_targets: Vec<String>,
    pub target_deployment_source: DeploymentSource<A>,
    pub running_deployment_source: Option<DeploymentSource<A>>,
}

pub struct GetPlanPreviewInput<A> {
    pub request: GetPlanPreviewRequest<A>,
    pub logger: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPreviewResult {
    pub deploy_target: String,
    pub summary: String,
    #[serde(default)]
    pub no_change: bool,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub diff_language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPlanPreviewResponse {
    pub results: Vec<PlanPreviewResult>,
}
