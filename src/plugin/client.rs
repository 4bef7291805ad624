use crate::error::Result;
use crate::logpersister::StageLogPersister;
use crate::toolregistry::ToolRegistry;
use std::sync::Arc;

/// Handles a stage execution uses to talk back to piped
#[derive(Clone)]
pub struct Client {
    stage_log_persister: Arc<dyn StageLogPersister>,
    tool_registry: Arc<ToolRegistry>,
}

impl Client {
    pub fn new(stage_log_persister: Arc<dyn StageLogPersister>, tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            stage_log_persister,
            tool_registry,
        }
    }

    /// Log writer for the stage being executed; shown in the piped UI
    pub fn log_persister(&self) -> &dyn StageLogPersister {
        self.stage_log_persister.as_ref()
    }

    pub fn tool_registry(&self) -> &ToolRegistry {
        &self.tool_registry
    }

    /// Shorthand for [`ToolRegistry::install_tool`]
    pub async fn install_tool(&self, name: &str, version: &str, install_script: &str) -> Result<String> {
        self.tool_registry
            .install_tool(name, version, install_script)
            .await
    }
}
