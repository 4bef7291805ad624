//! Unary interceptors wrapped around every service call.

use super::types::JSONRPC_VERSION;
use super::{CallContext, RpcError, RpcMetrics, Service};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument, Span};

/// A decoded request on its way to a service
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub service: String,
    pub method: String,
    pub params: Value,
    pub ctx: CallContext,
}

impl RpcRequest {
    /// Split `"<service>/<method>"`. A method without a slash leaves the service empty.
    pub fn parse(jsonrpc: String, full_method: &str, params: Option<Value>) -> Self {
        let (service, method) = match full_method.split_once('/') {
            Some((service, method)) => (service.to_string(), method.to_string()),
            None => (String::new(), full_method.to_string()),
        };
        Self {
            jsonrpc,
            service,
            method,
            params: params.unwrap_or(Value::Null),
            ctx: CallContext::default(),
        }
    }

    pub fn full_method(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }
}

/// Intercepts a call before it reaches the service
#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    async fn intercept(&self, req: RpcRequest, next: Next<'_>) -> Result<Value, RpcError>;
}

/// The remainder of the interceptor chain
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn UnaryInterceptor>],
    service: &'a dyn Service,
}

impl<'a> Next<'a> {
    pub fn new(interceptors: &'a [Arc<dyn UnaryInterceptor>], service: &'a dyn Service) -> Self {
        Self {
            interceptors,
            service,
        }
    }

    pub async fn run(self, req: RpcRequest) -> Result<Value, RpcError> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                first
                    .intercept(req, Next::new(rest, self.service))
                    .await
            }
            None => self.service.call(req.ctx, &req.method, req.params).await,
        }
    }
}

/// Logs every call with its latency and outcome
pub struct LogInterceptor {
    logger: Span,
}

impl LogInterceptor {
    pub fn new(logger: Span) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl UnaryInterceptor for LogInterceptor {
    async fn intercept(&self, req: RpcRequest, next: Next<'_>) -> Result<Value, RpcError> {
        let method = req.full_method();
        let start = Instant::now();
        let result = next.run(req).instrument(self.logger.clone()).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        self.logger.in_scope(|| match &result {
            Ok(_) => info!(method = %method, elapsed_ms, "handled rpc request"),
            Err(e) => warn!(
                method = %method,
                elapsed_ms,
                status = e.status(),
                error = %e,
                "rpc request failed"
            ),
        });
        result
    }
}

/// Rejects malformed requests before they reach a service
pub struct RequestValidationInterceptor;

#[async_trait]
impl UnaryInterceptor for RequestValidationInterceptor {
    async fn intercept(&self, req: RpcRequest, next: Next<'_>) -> Result<Value, RpcError> {
        if req.jsonrpc != JSONRPC_VERSION {
            return Err(RpcError::InvalidRequest(format!(
                "unsupported jsonrpc version {:?}",
                req.jsonrpc
            )));
        }
        if req.service.is_empty() || req.method.is_empty() {
            return Err(RpcError::InvalidRequest(format!(
                "method must be <service>/<method>, got {:?}",
                req.full_method()
            )));
        }
        if !(req.params.is_object() || req.params.is_null()) {
            return Err(RpcError::InvalidRequest(
                "params must be an object".to_string(),
            ));
        }
        next.run(req).await
    }
}

/// Ties each call to the server's shutdown token.
///
/// Calls arriving after shutdown started are refused; calls in flight see
/// their context cancelled when the shutdown signal arrives.
pub struct SignalHandlingInterceptor {
    shutdown: CancellationToken,
}

impl SignalHandlingInterceptor {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl UnaryInterceptor for SignalHandlingInterceptor {
    async fn intercept(&self, mut req: RpcRequest, next: Next<'_>) -> Result<Value, RpcError> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::Unavailable);
        }
        req.ctx = CallContext::new(self.shutdown.child_token());
        next.run(req).await
    }
}

/// Records request counts and latencies
pub struct PrometheusInterceptor {
    metrics: RpcMetrics,
}

impl PrometheusInterceptor {
    pub fn new(metrics: RpcMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl UnaryInterceptor for PrometheusInterceptor {
    async fn intercept(&self, req: RpcRequest, next: Next<'_>) -> Result<Value, RpcError> {
        let service = req.service.clone();
        let method = req.method.clone();
        let start = Instant::now();
        let result = next.run(req).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.status(),
        };
        self.metrics
            .observe(&service, &method, status, start.elapsed().as_secs_f64());
        result
    }
}
