//! Plugin registration and lifecycle.
//!
//! A plugin binary registers its role implementations with [`Plugin::builder`]
//! and hands control to [`Plugin::run`], which parses the command line,
//! connects to piped, assembles the shared context, runs the initializers and
//! then serves until it is told to stop.
//!
//! # Example
//!
//! ```rust,ignore
//! let plugin = Plugin::<ConfigNone, ClusterConfig, AppSpec>::builder(env!("CARGO_PKG_VERSION"))
//!     .with_deployment_plugin(Arc::new(KubernetesPlugin::default()))
//!     .with_livestate_plugin(Arc::new(KubernetesLivestate::default()))
//!     .build()?;
//! plugin.run().await?;
//! ```

pub mod client;
pub mod common;
pub mod lifecycle;
pub mod roles;
pub mod services;
pub mod types;

pub use client::Client;
pub use common::CommonFields;
pub use lifecycle::LifecycleState;
pub use roles::{
    DeploymentPlugin, InitializeInput, Initializer, LivestatePlugin, PlanPreviewPlugin,
    StagePlugin,
};
pub use services::{
    DeploymentPluginService, LivestatePluginService, PlanPreviewPluginService,
    StagePluginService,
};
pub use types::*;

use crate::admin::AdminServer;
use crate::cli::{Cli, Command, StartOptions};
use crate::client::{HttpPluginServiceClient, PluginServiceClient};
use crate::config::parse_plugin_config;
use crate::error::{Error, Result};
use crate::logging::init_logging;
use crate::logpersister::{LogPersister, Persister};
use crate::rpc::{RpcMetrics, Server, Service};
use crate::supervisor::Supervisor;
use crate::toolregistry::ToolRegistry;
use clap::Parser;
use lifecycle::StateTracker;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Span};

/// Default `--grace-period`
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

const REPORT_URL: &str = "https://github.com/pipe-cd/pipecd/issues";

/// Accumulates role registrations for a [`Plugin`]
pub struct PluginBuilder<C, D, A> {
    version: String,
    stage_plugin: Option<Arc<dyn StagePlugin<C, D, A>>>,
    deployment_plugin: Option<Arc<dyn DeploymentPlugin<C, D, A>>>,
    livestate_plugin: Option<Arc<dyn LivestatePlugin<C, D, A>>>,
    plan_preview_plugin: Option<Arc<dyn PlanPreviewPlugin<C, D, A>>>,
    grace_period: Duration,
}

impl<C, D, A> PluginBuilder<C, D, A>
where
    C: DeserializeOwned + Send + Sync + 'static,
    D: DeserializeOwned + Send + Sync + 'static,
    A: DeserializeOwned + Send + Sync + 'static,
{
    fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            stage_plugin: None,
            deployment_plugin: None,
            livestate_plugin: None,
            plan_preview_plugin: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Mutually exclusive with [`with_deployment_plugin`](Self::with_deployment_plugin)
    pub fn with_stage_plugin(mut self, plugin: Arc<dyn StagePlugin<C, D, A>>) -> Self {
        self.stage_plugin = Some(plugin);
        self
    }

    /// Mutually exclusive with [`with_stage_plugin`](Self::with_stage_plugin)
    pub fn with_deployment_plugin(mut self, plugin: Arc<dyn DeploymentPlugin<C, D, A>>) -> Self {
        self.deployment_plugin = Some(plugin);
        self
    }

    pub fn with_livestate_plugin(mut self, plugin: Arc<dyn LivestatePlugin<C, D, A>>) -> Self {
        self.livestate_plugin = Some(plugin);
        self
    }

    pub fn with_plan_preview_plugin(mut self, plugin: Arc<dyn PlanPreviewPlugin<C, D, A>>) -> Self {
        self.plan_preview_plugin = Some(plugin);
        self
    }

    /// Grace period used when `--grace-period` is not given
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Validate the role combination
    pub fn build(self) -> Result<Plugin<C, D, A>> {
        if self.stage_plugin.is_none()
            && self.deployment_plugin.is_none()
            && self.livestate_plugin.is_none()
            && self.plan_preview_plugin.is_none()
        {
            return Err(Error::Configuration(
                "at least one plugin must be registered".to_string(),
            ));
        }

        if let Some(stage) = &self.stage_plugin {
            if stage.as_deployment_plugin().is_some() {
                return Err(Error::Configuration(
                    "stage plugin cannot be a deployment plugin, you must use with_deployment_plugin instead"
                        .to_string(),
                ));
            }
        }

        if self.stage_plugin.is_some() && self.deployment_plugin.is_some() {
            return Err(Error::Configuration(
                "stage plugin and deployment plugin cannot be registered at the same time"
                    .to_string(),
            ));
        }

        Ok(Plugin {
            version: self.version,
            stage_plugin: self.stage_plugin,
            deployment_plugin: self.deployment_plugin,
            livestate_plugin: self.livestate_plugin,
            plan_preview_plugin: self.plan_preview_plugin,
            default_grace_period: self.grace_period,
            state: StateTracker::new(),
        })
    }
}

/// A validated set of role implementations, ready to run
pub struct Plugin<C, D, A> {
    version: String,
    stage_plugin: Option<Arc<dyn StagePlugin<C, D, A>>>,
    deployment_plugin: Option<Arc<dyn DeploymentPlugin<C, D, A>>>,
    livestate_plugin: Option<Arc<dyn LivestatePlugin<C, D, A>>>,
    plan_preview_plugin: Option<Arc<dyn PlanPreviewPlugin<C, D, A>>>,
    default_grace_period: Duration,
    state: StateTracker,
}

impl<C, D, A> Plugin<C, D, A>
where
    C: DeserializeOwned + Send + Sync + 'static,
    D: DeserializeOwned + Send + Sync + 'static,
    A: DeserializeOwned + Send + Sync + 'static,
{
    pub fn builder(version: impl Into<String>) -> PluginBuilder<C, D, A> {
        PluginBuilder::new(version)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn default_grace_period(&self) -> Duration {
        self.default_grace_period
    }

    pub fn state(&self) -> LifecycleState {
        self.state.current()
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Entry point of a plugin binary: parse the command line and run until
    /// SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<()> {
        self.run_with(Cli::parse()).await
    }

    pub async fn run_with(&self, cli: Cli) -> Result<()> {
        let _guard = init_logging(&cli.log_config())
            .map_err(|e| Error::Internal(format!("failed to initialize logging: {:#}", e)))?;

        let Command::Start(mut options) = cli.command;
        options.metrics = cli.metrics;

        let shutdown = CancellationToken::new();
        spawn_signal_handler(shutdown.clone())?;
        self.start(options, shutdown).await
    }

    /// Run the plugin until `shutdown` is cancelled or a subsystem fails.
    ///
    /// Returns `Ok(())` after a clean shutdown. Every failure is logged here
    /// before it is returned. `shutdown` is always cancelled on return.
    pub async fn start(&self, options: StartOptions, shutdown: CancellationToken) -> Result<()> {
        self.state.reset();
        let result = self.start_inner(options, shutdown.clone()).await;
        // stop anything that is still listening for the token, e.g. the signal handler
        shutdown.cancel();
        match &result {
            Ok(()) => self.state.transition(LifecycleState::Terminated),
            Err(_) => self.state.transition(LifecycleState::Failed),
        }
        result
    }

    async fn start_inner(&self, options: StartOptions, shutdown: CancellationToken) -> Result<()> {
        let root = info_span!("plugin", version = %self.version);

        if self.stage_plugin.is_some() && self.deployment_plugin.is_some() {
            return Err(self.report_bug(
                &root,
                "stage plugin and deployment plugin cannot be registered at the same time",
            ));
        }

        let grace_period = options.grace_period.unwrap_or(self.default_grace_period);
        let tls_files = match (options.tls, &options.cert_file, &options.key_file) {
            (false, _, _) => None,
            (true, Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            (true, _, _) => {
                let err = Error::Config("--tls requires --cert-file and --key-file".to_string());
                root.in_scope(|| error!(error = %err, "invalid tls options"));
                return Err(err);
            }
        };

        let client: Arc<dyn PluginServiceClient> =
            match HttpPluginServiceClient::connect(&options.piped_plugin_service).await {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    root.in_scope(|| error!(error = %e, "failed to create piped plugin service client"));
                    return Err(e);
                }
            };

        let config = match parse_plugin_config(&options.config) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                root.in_scope(|| error!(error = %e, "failed to parse the configuration"));
                return Err(e);
            }
        };
        self.state.transition(LifecycleState::ContextBuilt);

        let logger = info_span!(
            "plugin",
            "plugin-name" = %config.name,
            "plugin-version" = %self.version
        );

        let persister = Arc::new(
            Persister::new(Arc::clone(&client), logger.clone()).with_grace_period(grace_period),
        );
        let tool_registry = Arc::new(ToolRegistry::new(Arc::clone(&client)));

        self.state.transition(LifecycleState::Initializing);
        let log_persister: Arc<dyn LogPersister> = persister.clone();
        let common = match CommonFields::<C, D>::assemble(
            self.version.clone(),
            Arc::clone(&config),
            logger.clone(),
            log_persister,
            Arc::clone(&client),
            tool_registry,
        ) {
            Ok(common) => common,
            Err(e) => {
                logger.in_scope(|| error!(error = %e, "failed to decode the plugin configuration"));
                return Err(e);
            }
        };

        let services = self.initialize_services(&common, &logger).await?;
        if services.is_empty() {
            return Err(self.report_bug(&logger, "no plugin is registered"));
        }

        let metrics = if options.metrics {
            Some(RpcMetrics::new().map_err(|e| {
                Error::Internal(format!("failed to register rpc metrics: {}", e))
            })?)
        } else {
            None
        };

        let mut admin = AdminServer::new(config.name.clone(), self.version.clone())
            .with_port(options.admin_port)
            .with_grace_period(grace_period)
            .with_logger(logger.clone());
        if let Some(metrics) = &metrics {
            admin = admin.with_metrics(metrics.clone());
        }

        let mut server = Server::new(Arc::clone(&services[0]))
            .with_port(config.port)
            .with_grace_period(grace_period)
            .with_logger(logger.clone())
            .with_log_interceptor(logger.clone())
            .with_request_validation()
            .with_signal_handling(shutdown.clone());
        if let Some((cert_file, key_file)) = tls_files {
            server = server.with_tls(cert_file, key_file);
        }
        if options.enable_grpc_reflection {
            server = server.with_reflection();
        }
        if let Some(metrics) = metrics {
            server = server.with_prometheus(metrics);
        }
        for service in &services[1..] {
            server = server.with_service(Arc::clone(service));
        }

        let mut supervisor = Supervisor::new(shutdown.clone());
        supervisor.spawn("admin", admin.run(shutdown.clone()));
        {
            let persister = Arc::clone(&persister);
            let shutdown = shutdown.clone();
            supervisor.spawn("log-persister", async move { persister.run(shutdown).await });
        }
        supervisor.spawn("rpc-server", server.run(shutdown.clone()));

        self.state.transition(LifecycleState::Serving);
        logger.in_scope(|| info!(?grace_period, "plugin is running"));

        let wait = supervisor.wait();
        tokio::pin!(wait);
        let result = tokio::select! {
            result = &mut wait => result,
            _ = shutdown.cancelled() => {
                self.state.transition(LifecycleState::Draining);
                logger.in_scope(|| info!("shutting down"));
                wait.await
            }
        };

        match &result {
            Ok(()) => logger.in_scope(|| info!("plugin stopped")),
            Err(e) => logger.in_scope(|| error!(error = %e, "failed while running")),
        }
        result
    }

    /// Run each role's initializer and wrap the role in its adapter.
    ///
    /// Adapters come out in a fixed order: stage or deployment, livestate,
    /// plan preview.
    async fn initialize_services(
        &self,
        common: &CommonFields<C, D>,
        logger: &Span,
    ) -> Result<Vec<Arc<dyn Service>>> {
        let input = InitializeInput {
            config: common.plugin_config.clone(),
            deploy_targets: Arc::clone(&common.deploy_targets),
            logger: info_span!(parent: logger, "plugin-initializer"),
        };

        let mut services: Vec<Arc<dyn Service>> = Vec::new();

        if let Some(stage) = &self.stage_plugin {
            initialize("stage", stage.initializer(), &input, logger).await?;
            services.push(Arc::new(StagePluginService::new(
                Arc::clone(stage),
                common.with_logger(info_span!(parent: logger, "stage-service")),
            )));
        }

        if let Some(deployment) = &self.deployment_plugin {
            initialize("deployment", deployment.initializer(), &input, logger).await?;
            services.push(Arc::new(DeploymentPluginService::new(
                Arc::clone(deployment),
                common.with_logger(info_span!(parent: logger, "deployment-service")),
            )));
        }

        if let Some(livestate) = &self.livestate_plugin {
            initialize("livestate", livestate.initializer(), &input, logger).await?;
            services.push(Arc::new(LivestatePluginService::new(
                Arc::clone(livestate),
                common.with_logger(info_span!(parent: logger, "livestate-service")),
            )));
        }

        if let Some(plan_preview) = &self.plan_preview_plugin {
            initialize("plan-preview", plan_preview.initializer(), &input, logger).await?;
            services.push(Arc::new(PlanPreviewPluginService::new(
                Arc::clone(plan_preview),
                common.with_logger(info_span!(parent: logger, "plan-preview-service")),
            )));
        }

        Ok(services)
    }

    fn report_bug(&self, logger: &Span, reason: &str) -> Error {
        logger.in_scope(|| {
            error!(
                version = %self.version,
                reason,
                "report-url" = REPORT_URL,
                "something went wrong in the SDK, please report this issue to the developers"
            )
        });
        Error::InternalInvariant(reason.to_string())
    }
}

async fn initialize<C, D>(
    role: &'static str,
    initializer: Option<&dyn Initializer<C, D>>,
    input: &InitializeInput<C, D>,
    logger: &Span,
) -> Result<()> {
    let Some(initializer) = initializer else {
        return Ok(());
    };
    initializer.initialize(input).await.map_err(|source| {
        logger.in_scope(|| error!(role, error = %source, "failed to initialize plugin"));
        Error::Initialization { role, source }
    })
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
                _ = sigint.recv() => info!("received SIGINT, initiating shutdown"),
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, initiating shutdown"),
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
        });
    }

    Ok(())
}
