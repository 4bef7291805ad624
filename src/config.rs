//! Plugin configuration as handed over by piped.
//!
//! The file is produced by piped and lists the plugin's name, the port it
//! must serve on, an opaque plugin-specific payload and the deploy targets
//! the plugin is responsible for. Payloads stay untyped here; they are
//! decoded into the plugin author's types when the shared context is built.

pub mod loader;

pub use loader::{parse_plugin_config, ConfigLoader};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// Parsed plugin configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PipedPlugin {
    /// The name of the plugin, unique within a piped.
    #[validate(length(min = 1))]
    pub name: String,
    /// Port the plugin's RPC server binds to. 0 picks an ephemeral port.
    #[serde(default)]
    pub port: u16,
    /// Source URL the plugin binary was fetched from.
    #[serde(default)]
    pub url: String,
    /// Plugin-specific configuration, decoded by the plugin itself.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    /// Deploy targets handled by this plugin.
    #[serde(default)]
    #[validate(nested)]
    pub deploy_targets: Vec<PipedDeployTarget>,
}

/// One deploy target entry as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Validate)]
pub struct PipedDeployTarget {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}
