//! JSON-RPC serving endpoint.
//!
//! Role adapters implement [`Service`] and are mounted on a [`Server`]. A
//! request's `method` is `"<service>/<method>"`; the server routes it through
//! the configured [`UnaryInterceptor`] chain to the matching service.

pub mod interceptor;
pub mod metrics;
pub mod server;
pub mod types;

pub use interceptor::{
    LogInterceptor, Next, PrometheusInterceptor, RequestValidationInterceptor, RpcRequest,
    SignalHandlingInterceptor, UnaryInterceptor,
};
pub use metrics::RpcMetrics;
pub use server::Server;
pub use types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, ServiceDescriptor};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors a service call can end with
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Server is shutting down")]
    Unavailable,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i32 {
        match self {
            RpcError::InvalidRequest(_) => types::codes::INVALID_REQUEST,
            RpcError::MethodNotFound(_) => types::codes::METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => types::codes::INVALID_PARAMS,
            RpcError::Unavailable => types::codes::UNAVAILABLE,
            RpcError::Cancelled => types::codes::CANCELLED,
            RpcError::Internal(_) => types::codes::INTERNAL_ERROR,
        }
    }

    /// Short status label used in logs and metrics
    pub fn status(&self) -> &'static str {
        match self {
            RpcError::InvalidRequest(_) => "invalid_request",
            RpcError::MethodNotFound(_) => "method_not_found",
            RpcError::InvalidParams(_) => "invalid_params",
            RpcError::Unavailable => "unavailable",
            RpcError::Cancelled => "cancelled",
            RpcError::Internal(_) => "internal",
        }
    }
}

impl From<RpcError> for JsonRpcError {
    fn from(err: RpcError) -> Self {
        JsonRpcError {
            code: err.code(),
            message: err.to_string(),
            data: None,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::InvalidParams(err.to_string())
    }
}

/// Per-call context handed to services.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Token cancelled when the server starts shutting down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of the serving protocol.
#[async_trait]
pub trait Service: Send + Sync {
    /// Service name, the part of the method before the slash
    fn name(&self) -> &'static str;

    /// Methods this service answers
    fn methods(&self) -> &'static [&'static str];

    /// Handle one call
    async fn call(&self, ctx: CallContext, method: &str, params: Value) -> Result<Value, RpcError>;
}
