//! # piped-plugin-sdk
//!
//! Runtime for PipeCD piped plugins.
//!
//! A plugin implements one or more roles ([`plugin::StagePlugin`],
//! [`plugin::DeploymentPlugin`], [`plugin::LivestatePlugin`],
//! [`plugin::PlanPreviewPlugin`]) and registers them on a [`Plugin`]. The
//! runtime takes care of the command line, the connection to piped, config
//! decoding, initialization and serving the roles over JSON-RPC next to an
//! admin server and the stage log persister.

pub mod admin;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod logpersister;
pub mod plugin;
pub mod rpc;
pub mod supervisor;
pub mod toolregistry;

pub use cli::StartOptions;
pub use error::{Error, Result};
pub use plugin::{LifecycleState, Plugin, PluginBuilder};
