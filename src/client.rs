//! Client for the piped plugin service.
//!
//! piped exposes a small JSON-RPC API to its plugins; the log persister and
//! the tool registry talk to piped through it.

use crate::{
    error::{Error, Result},
    rpc::types::{JsonRpcRequest, JsonRpcResponse},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// How long startup waits for the plugin service to accept a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a single call to piped
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Severity of a stage log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    Info,
    Success,
    Error,
}

/// One line of stage log, as stored by piped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBlock {
    pub index: u64,
    pub log: String,
    pub severity: LogSeverity,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStageLogsRequest {
    pub deployment_id: String,
    pub stage_id: String,
    pub retried_count: u32,
    pub blocks: Vec<LogBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallToolRequest {
    pub name: String,
    pub version: String,
    pub install_script: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallToolResponse {
    pub installed_path: String,
}

/// Operations piped offers to its plugins
#[async_trait]
pub trait PluginServiceClient: Send + Sync {
    /// Append log blocks to a stage's log
    async fn report_stage_logs(&self, request: ReportStageLogsRequest) -> Result<()>;

    /// Install a tool and return the path of the installed binary
    async fn install_tool(&self, request: InstallToolRequest) -> Result<InstallToolResponse>;
}

/// JSON-RPC over HTTP implementation of [`PluginServiceClient`]
pub struct HttpPluginServiceClient {
    client: Client,
    base_url: String,
    next_id: AtomicI64,
}

impl HttpPluginServiceClient {
    /// Create a client without checking that the service is reachable
    pub fn new(address: &str) -> Result<Self> {
        Self::with_request_timeout(address, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(address: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}/rpc", address.trim_end_matches('/'))
        } else {
            format!("http://{}/rpc", address)
        };
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url,
            next_id: AtomicI64::new(1),
        })
    }

    /// Create a client and make sure the service accepts connections
    pub async fn connect(address: &str) -> Result<Self> {
        Self::connect_with_timeout(address, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(address: &str, timeout: Duration) -> Result<Self> {
        let host = address
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');

        let connection_error = |source: std::io::Error| Error::Connection {
            address: address.to_string(),
            source,
        };
        match tokio::time::timeout(timeout, TcpStream::connect(host)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(connection_error(e)),
            Err(_) => {
                return Err(connection_error(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no answer within {:?}", timeout),
                )))
            }
        }

        debug!(address = %address, "connected to piped plugin service");
        Self::new(address)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: impl Serialize) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(
            method,
            Some(serde_json::to_value(params)?),
            Some(Value::from(id)),
        );

        let response: JsonRpcResponse = self
            .client
            .post(&self.base_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(Error::Internal(format!(
                "plugin service error: {} (code: {})",
                error.message, error.code
            )));
        }

        let result = response.result.unwrap_or(Value::Null);
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait]
impl PluginServiceClient for HttpPluginServiceClient {
    async fn report_stage_logs(&self, request: ReportStageLogsRequest) -> Result<()> {
        let _: Value = self
            .request("PluginService/ReportStageLogs", request)
            .await?;
        Ok(())
    }

    async fn install_tool(&self, request: InstallToolRequest) -> Result<InstallToolResponse> {
        self.request("PluginService/InstallTool", request).await
    }
}
