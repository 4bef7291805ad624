//! `pipecd-plugin`: a stage plugin providing the `WAIT` stage.
//!
//! The stage sleeps for the duration given in its config (`{"duration": "1m"}`)
//! and reports progress to the stage log.

use async_trait::async_trait;
use piped_plugin_sdk::plugin::{
    BuildPipelineSyncStagesInput, BuildPipelineSyncStagesResponse, ConfigNone, DeployTarget,
    ExecuteStageInput, ExecuteStageResponse, PipelineStage, Plugin, StagePlugin, StageStatus,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const WAIT_STAGE: &str = "WAIT";
const DEFAULT_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
struct WaitStageOptions {
    #[serde(default)]
    duration: Option<String>,
}

impl WaitStageOptions {
    fn duration(&self) -> anyhow::Result<Duration> {
        match &self.duration {
            Some(raw) => Ok(humantime::parse_duration(raw)?),
            None => Ok(DEFAULT_WAIT),
        }
    }
}

struct WaitStagePlugin;

#[async_trait]
impl StagePlugin<ConfigNone, ConfigNone, ConfigNone> for WaitStagePlugin {
    fn fetch_defined_stages(&self) -> Vec<String> {
        vec![WAIT_STAGE.to_string()]
    }

    async fn build_pipeline_sync_stages(
        &self,
        _config: Option<&ConfigNone>,
        input: BuildPipelineSyncStagesInput,
    ) -> anyhow::Result<BuildPipelineSyncStagesResponse> {
        let stages = input
            .request
            .stages
            .into_iter()
            .map(|stage| PipelineStage {
                index: stage.index,
                name: stage.name,
                description: "Wait for a while before continuing".to_string(),
                rollback: false,
                metadata: HashMap::new(),
            })
            .collect();
        Ok(BuildPipelineSyncStagesResponse { stages })
    }

    async fn execute_stage(
        &self,
        _config: Option<&ConfigNone>,
        _deploy_targets: &[Arc<DeployTarget<ConfigNone>>],
        input: ExecuteStageInput<ConfigNone>,
    ) -> anyhow::Result<ExecuteStageResponse> {
        if input.request.stage_name != WAIT_STAGE {
            anyhow::bail!("unsupported stage {}", input.request.stage_name);
        }

        let options: WaitStageOptions = if input.request.stage_config.is_null() {
            WaitStageOptions::default()
        } else {
            serde_json::from_value(input.request.stage_config.clone())?
        };
        let duration = options.duration()?;

        let log = input.client.log_persister();
        log.info(&format!("Waiting for {}...", humantime::format_duration(duration)));
        input
            .logger
            .in_scope(|| info!(?duration, "waiting"));

        tokio::time::sleep(duration).await;

        log.success(&format!("Waited for {}", humantime::format_duration(duration)));
        Ok(ExecuteStageResponse {
            status: StageStatus::Success,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let plugin = match Plugin::<ConfigNone, ConfigNone, ConfigNone>::builder(env!("CARGO_PKG_VERSION"))
        .with_stage_plugin(Arc::new(WaitStagePlugin))
        .build()
    {
        Ok(plugin) => plugin,
        Err(e) => {
            eprintln!("failed to build plugin: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // failures are logged by the runtime
    match plugin.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
