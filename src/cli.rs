//! Command line interface of a plugin binary.

use crate::logging::{LogConfig, LogEncoding};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "pipecd-plugin", about = "Plugin component for Piped.", version)]
pub struct Cli {
    /// Log level or filter directive
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogEncoding::Console)]
    pub log_encoding: LogEncoding,

    /// Record prometheus metrics for RPC requests
    #[arg(long, global = true)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start running a plugin.
    Start(StartOptions),
}

impl Cli {
    pub fn log_config(&self) -> LogConfig {
        LogConfig::default()
            .with_level(self.log_level.clone())
            .with_encoding(self.log_encoding)
    }
}

/// Options of the `start` subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct StartOptions {
    /// The address used to connect to the piped plugin service.
    #[arg(long, required = true)]
    pub piped_plugin_service: String,

    /// The configuration for the plugin.
    #[arg(long, required = true)]
    pub config: PathBuf,

    /// How long to wait for graceful shutdown, e.g. "30s" or "1m".
    #[arg(long, value_parser = humantime::parse_duration)]
    pub grace_period: Option<Duration>,

    /// Whether running the RPC server with TLS or not.
    #[arg(long)]
    pub tls: bool,

    /// The path to the TLS certificate file.
    #[arg(long)]
    pub cert_file: Option<PathBuf>,

    /// The path to the TLS key file.
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Whether to enable the reflection endpoint or not.
    #[arg(long)]
    pub enable_grpc_reflection: bool,

    /// Port of the admin server. 0 picks an ephemeral port.
    #[arg(long, default_value_t = 0)]
    pub admin_port: u16,

    /// Copied from the global `--metrics` flag
    #[arg(skip)]
    pub metrics: bool,
}

impl StartOptions {
    pub fn new(piped_plugin_service: impl Into<String>, config: impl Into<PathBuf>) -> Self {
        Self {
            piped_plugin_service: piped_plugin_service.into(),
            config: config.into(),
            ..Default::default()
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    pub fn with_tls(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.tls = true;
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    pub fn with_reflection(mut self) -> Self {
        self.enable_grpc_reflection = true;
        self
    }

    pub fn with_admin_port(mut self, port: u16) -> Self {
        self.admin_port = port;
        self
    }

    pub fn with_metrics(mut self) -> Self {
        self.metrics = true;
        self
    }
}
