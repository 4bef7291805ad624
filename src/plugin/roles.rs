//! The traits a plugin author implements.
//!
//! `C` is the plugin config, `D` the per deploy target config and `A` the
//! application config spec. A plugin registers a stage plugin or a deployment
//! plugin (never both), optionally alongside a livestate and a plan preview
//! plugin.

use super::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::Span;

/// Data handed to [`Initializer::initialize`]
pub struct InitializeInput<C, D> {
    pub config: Option<Arc<C>>,
    pub deploy_targets: DeployTargetTable<D>,
    pub logger: Span,
}

/// One-time setup run before the plugin serves any request.
///
/// An instance registered under several roles is initialized once per role;
/// guard with a `tokio::sync::OnceCell` if that matters.
#[async_trait]
pub trait Initializer<C, D>: Send + Sync {
    async fn initialize(&self, input: &InitializeInput<C, D>) -> anyhow::Result<()>;
}

/// Executes stages defined by the plugin inside a pipeline owned by another plugin
#[async_trait]
pub trait StagePlugin<C, D, A>: Send + Sync {
    /// Stage names this plugin can execute
    fn fetch_defined_stages(&self) -> Vec<String>;

    async fn build_pipeline_sync_stages(
        &self,
        config: Option<&C>,
        input: BuildPipelineSyncStagesInput,
    ) -> anyhow::Result<BuildPipelineSyncStagesResponse>;

    async fn execute_stage(
        &self,
        config: Option<&C>,
        deploy_targets: &[Arc<DeployTarget<D>>],
        input: ExecuteStageInput<A>,
    ) -> anyhow::Result<ExecuteStageResponse>;

    fn initializer(&self) -> Option<&dyn Initializer<C, D>> {
        None
    }

    /// Types that also implement [`DeploymentPlugin`] return `Some(self)` here
    /// so registration can reject them as stage plugins.
    fn as_deployment_plugin(&self) -> Option<&dyn DeploymentPlugin<C, D, A>> {
        None
    }
}

/// Owns the whole deployment flow of its applications
#[async_trait]
pub trait DeploymentPlugin<C, D, A>: Send + Sync {
    fn fetch_defined_stages(&self) -> Vec<String>;

    async fn determine_versions(
        &self,
        config: Option<&C>,
        input: DetermineVersionsInput<A>,
    ) -> anyhow::Result<DetermineVersionsResponse>;

    /// `None` lets piped fall back to its default strategy
    async fn determine_strategy(
        &self,
        config: Option<&C>,
        input: DetermineStrategyInput<A>,
    ) -> anyhow::Result<Option<DetermineStrategyResponse>>;

    async fn build_pipeline_sync_stages(
        &self,
        config: Option<&C>,
        input: BuildPipelineSyncStagesInput,
    ) -> anyhow::Result<BuildPipelineSyncStagesResponse>;

    async fn build_quick_sync_stages(
        &self,
        config: Option<&C>,
        input: BuildQuickSyncStagesInput,
    ) -> anyhow::Result<BuildQuickSyncStagesResponse>;

    async fn execute_stage(
        &self,
        config: Option<&C>,
        deploy_targets: &[Arc<DeployTarget<D>>],
        input: ExecuteStageInput<A>,
    ) -> anyhow::Result<ExecuteStageResponse>;

    fn initializer(&self) -> Option<&dyn Initializer<C, D>> {
        None
    }
}

/// Reports the live state of applications
#[async_trait]
pub trait LivestatePlugin<C, D, A>: Send + Sync {
    async fn get_livestate(
        &self,
        config: Option<&C>,
        deploy_targets: &[Arc<DeployTarget<D>>],
        input: GetLivestateInput<A>,
    ) -> anyhow::Result<GetLivestateResponse>;

    fn initializer(&self) -> Option<&dyn Initializer<C, D>> {
        None
    }
}

/// Computes what a deployment would change before it runs
#[async_trait]
pub trait PlanPreviewPlugin<C, D, A>: Send + Sync {
    async fn get_plan_preview(
        &self,
        config: Option<&C>,
        deploy_targets: &[Arc<DeployTarget<D>>],
        input: GetPlanPreviewInput<A>,
    ) -> anyhow::Result<GetPlanPreviewResponse>;

    fn initializer(&self) -> Option<&dyn Initializer<C, D>> {
        None
    }
}
