use super::PipedPlugin;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use validator::Validate;

/// Supported configuration file encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Detect the format from a file extension. Unknown extensions are read as JSON,
    /// which is what piped writes.
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => ConfigFormat::Yaml,
            "toml" => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_file: None }
    }

    /// Load configuration from file
    pub fn load_from_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Read, decode and validate the configuration
    pub fn build(self) -> Result<PipedPlugin> {
        let path = self
            .config_file
            .ok_or_else(|| Error::Config("no configuration file given".to_string()))?;

        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let format = ConfigFormat::from_path(&path);
        let plugin = Self::parse(&content, format)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;

        plugin
            .validate()
            .map_err(|e| Error::Config(format!("invalid plugin configuration: {}", e)))?;

        Ok(plugin)
    }

    fn parse(content: &str, format: ConfigFormat) -> std::result::Result<PipedPlugin, String> {
        match format {
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
            ConfigFormat::Yaml => serde_yaml_ng::from_str(content).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the plugin configuration file at `path`.
pub fn parse_plugin_config(path: impl AsRef<Path>) -> Result<PipedPlugin> {
    ConfigLoader::new()
        .load_from_file(path.as_ref())
        .build()
}
