//! State shared by every role of a running plugin.

use super::types::{DeployTarget, DeployTargetTable};
use crate::client::PluginServiceClient;
use crate::config::{PipedDeployTarget, PipedPlugin};
use crate::error::{Error, Result};
use crate::logpersister::LogPersister;
use crate::toolregistry::ToolRegistry;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{warn, Span};

/// Identity, configuration and handles assembled once at startup.
///
/// Every role adapter holds its own copy that differs only in the logger.
pub struct CommonFields<C, D> {
    pub name: String,
    pub version: String,
    pub config: Arc<PipedPlugin>,
    pub logger: Span,
    pub log_persister: Arc<dyn LogPersister>,
    pub client: Arc<dyn PluginServiceClient>,
    pub tool_registry: Arc<ToolRegistry>,
    pub plugin_config: Option<Arc<C>>,
    pub deploy_targets: DeployTargetTable<D>,
}

impl<C, D> Clone for CommonFields<C, D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            config: Arc::clone(&self.config),
            logger: self.logger.clone(),
            log_persister: Arc::clone(&self.log_persister),
            client: Arc::clone(&self.client),
            tool_registry: Arc::clone(&self.tool_registry),
            plugin_config: self.plugin_config.clone(),
            deploy_targets: Arc::clone(&self.deploy_targets),
        }
    }
}

impl<C, D> CommonFields<C, D>
where
    C: DeserializeOwned,
    D: DeserializeOwned,
{
    /// Decode the typed plugin config and deploy targets and bundle them with the handles.
    ///
    /// Fails on the first payload that does not decode; nothing partial is returned.
    pub fn assemble(
        version: impl Into<String>,
        config: Arc<PipedPlugin>,
        logger: Span,
        log_persister: Arc<dyn LogPersister>,
        client: Arc<dyn PluginServiceClient>,
        tool_registry: Arc<ToolRegistry>,
    ) -> Result<Self> {
        let plugin_config = decode_plugin_config::<C>(&config)?.map(Arc::new);
        let deploy_targets = Arc::new(decode_deploy_targets::<D>(&config.deploy_targets, &logger)?);

        Ok(Self {
            name: config.name.clone(),
            version: version.into(),
            config,
            logger,
            log_persister,
            client,
            tool_registry,
            plugin_config,
            deploy_targets,
        })
    }
}

impl<C, D> CommonFields<C, D> {
    /// Copy with only the logger replaced
    pub fn with_logger(&self, logger: Span) -> Self {
        Self {
            logger,
            ..self.clone()
        }
    }

    pub fn plugin_config(&self) -> Option<&C> {
        self.plugin_config.as_deref()
    }

    pub fn deploy_target(&self, name: &str) -> Option<&Arc<DeployTarget<D>>> {
        self.deploy_targets.get(name)
    }
}

/// `None` when the plugin has no config payload at all.
pub fn decode_plugin_config<C: DeserializeOwned>(config: &PipedPlugin) -> Result<Option<C>> {
    let Some(raw) = &config.config else {
        return Ok(None);
    };
    serde_json::from_value(raw.clone())
        .map(Some)
        .map_err(|e| Error::Config(format!("failed to decode config of plugin {}: {}", config.name, e)))
}

/// Decode every deploy target payload, keyed by name.
///
/// A later entry with the same name replaces an earlier one. Entries without a
/// payload decode from an empty object.
pub fn decode_deploy_targets<D: DeserializeOwned>(
    entries: &[PipedDeployTarget],
    logger: &Span,
) -> Result<HashMap<String, Arc<DeployTarget<D>>>> {
    let mut table = HashMap::with_capacity(entries.len());
    for entry in entries {
        let raw = entry
            .config
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let config: D = serde_json::from_value(raw).map_err(|e| {
            Error::Config(format!(
                "failed to decode config of deploy target {}: {}",
                entry.name, e
            ))
        })?;

        let target = Arc::new(DeployTarget {
            name: entry.name.clone(),
            labels: entry.labels.clone(),
            config,
        });
        if table.insert(entry.name.clone(), target).is_some() {
            logger.in_scope(|| {
                warn!(
                    deploy_target = %entry.name,
                    "duplicate deploy target name, the last entry wins"
                )
            });
        }
    }
    Ok(table)
}
