//! Tool installation through piped.
//!
//! Plugins ask piped to install the command line tools they drive (kubectl,
//! terraform, ...). Installed paths are remembered for the process lifetime so
//! each tool version is installed at most once.

use crate::client::{InstallToolRequest, PluginServiceClient};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info};

type ToolKey = (String, String);

pub struct ToolRegistry {
    client: Arc<dyn PluginServiceClient>,
    installed: Mutex<HashMap<ToolKey, Arc<OnceCell<String>>>>,
}

impl ToolRegistry {
    pub fn new(client: Arc<dyn PluginServiceClient>) -> Self {
        Self {
            client,
            installed: Mutex::new(HashMap::new()),
        }
    }

    /// Install `name` at `version` with the given script, returning the binary path.
    ///
    /// Concurrent calls for the same tool version share one install; other
    /// tools are installed independently.
    pub async fn install_tool(&self, name: &str, version: &str, install_script: &str) -> Result<String> {
        let cell = {
            let mut installed = self
                .installed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            installed
                .entry((name.to_string(), version.to_string()))
                .or_default()
                .clone()
        };

        if let Some(path) = cell.get() {
            debug!(tool = %name, version = %version, path = %path, "tool already installed");
            return Ok(path.clone());
        }

        // a failed install leaves the cell empty so the next call retries
        let path = cell
            .get_or_try_init(|| async {
                let response = self
                    .client
                    .install_tool(InstallToolRequest {
                        name: name.to_string(),
                        version: version.to_string(),
                        install_script: install_script.to_string(),
                    })
                    .await?;
                info!(tool = %name, version = %version, path = %response.installed_path, "installed tool");
                Ok::<_, Error>(response.installed_path)
            })
            .await?;
        Ok(path.clone())
    }
}
