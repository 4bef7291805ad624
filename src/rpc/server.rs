//! HTTP transport for the JSON-RPC services.

use super::interceptor::{
    LogInterceptor, Next, PrometheusInterceptor, RequestValidationInterceptor, RpcRequest,
    SignalHandlingInterceptor, UnaryInterceptor,
};
use super::types::{codes, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ServiceDescriptor};
use super::{CallContext, RpcError, RpcMetrics, Service};
use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Span};

/// Default time granted to in-flight requests on shutdown
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct TlsFiles {
    cert_file: PathBuf,
    key_file: PathBuf,
}

/// JSON-RPC server hosting a fixed set of services
pub struct Server {
    services: Vec<Arc<dyn Service>>,
    bind_addr: String,
    port: u16,
    grace_period: Duration,
    tls: Option<TlsFiles>,
    reflection: bool,
    interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    logger: Span,
}

impl Server {
    /// Create a server around its first service
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self {
            services: vec![service],
            bind_addr: "0.0.0.0".to_string(),
            port: 0,
            grace_period: DEFAULT_GRACE_PERIOD,
            tls: None,
            reflection: false,
            interceptors: Vec::new(),
            logger: Span::none(),
        }
    }

    /// Mount an additional service
    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_logger(mut self, logger: Span) -> Self {
        self.logger = logger;
        self
    }

    /// Serve over TLS using a PEM certificate and PKCS#8 PEM key
    pub fn with_tls(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsFiles {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        });
        self
    }

    /// Expose `GET /reflection` listing services and methods
    pub fn with_reflection(mut self) -> Self {
        self.reflection = true;
        self
    }

    /// Append an interceptor; interceptors run in the order they were added
    pub fn with_interceptor(mut self, interceptor: Arc<dyn UnaryInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_log_interceptor(self, logger: Span) -> Self {
        self.with_interceptor(Arc::new(LogInterceptor::new(logger)))
    }

    pub fn with_request_validation(self) -> Self {
        self.with_interceptor(Arc::new(RequestValidationInterceptor))
    }

    pub fn with_signal_handling(self, shutdown: CancellationToken) -> Self {
        self.with_interceptor(Arc::new(SignalHandlingInterceptor::new(shutdown)))
    }

    pub fn with_prometheus(self, metrics: RpcMetrics) -> Self {
        self.with_interceptor(Arc::new(PrometheusInterceptor::new(metrics)))
    }

    /// Names of the mounted services, in registration order
    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// Build the axum router for the mounted services
    pub fn router(&self) -> Router {
        let mut services = HashMap::new();
        let mut descriptors = Vec::with_capacity(self.services.len());
        for service in &self.services {
            if services.insert(service.name(), Arc::clone(service)).is_some() {
                warn!(service = service.name(), "service registered twice, keeping the last one");
            }
            descriptors.push(ServiceDescriptor {
                service: service.name().to_string(),
                methods: service.methods().iter().map(|m| m.to_string()).collect(),
            });
        }

        let dispatcher = Arc::new(Dispatcher {
            services,
            interceptors: self.interceptors.clone(),
            descriptors,
        });

        let mut router = Router::new().route("/rpc", post(handle_json_rpc));
        if self.reflection {
            router = router.route("/reflection", get(handle_reflection));
        }
        router
            .layer(TraceLayer::new_for_http())
            .with_state(dispatcher)
    }

    /// Bind the configured port and serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let bind_addr = format!("{}:{}", self.bind_addr, self.port);
        let listener = TcpListener::bind(&bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` is cancelled.
    ///
    /// In-flight connections are asked to finish once shutdown starts and are
    /// dropped when the grace period runs out.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let tls = match &self.tls {
            Some(files) => Some(load_tls_acceptor(files)?),
            None => None,
        };
        let router = self.router();
        let local_addr = listener.local_addr()?;

        self.logger.in_scope(|| {
            info!(
                addr = %local_addr,
                tls = tls.is_some(),
                reflection = self.reflection,
                services = ?self.service_names(),
                "rpc server listening"
            )
        });

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let router = router.clone();
                    let tls = tls.clone();
                    let conn_shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => serve_connection(stream, router, conn_shutdown).await,
                                Err(e) => {
                                    debug!(peer = %peer_addr, error = %e, "tls handshake failed");
                                    return;
                                }
                            },
                            None => serve_connection(stream, router, conn_shutdown).await,
                        };
                        if let Err(e) = result {
                            debug!(peer = %peer_addr, error = %e, "connection error");
                        }
                    });
                }
            }
        }

        drop(listener);
        tracker.close();
        self.logger.in_scope(|| {
            info!(
                connections = tracker.len(),
                grace_period = ?self.grace_period,
                "rpc server draining"
            )
        });
        if tokio::time::timeout(self.grace_period, tracker.wait())
            .await
            .is_err()
        {
            self.logger.in_scope(|| {
                warn!(
                    connections = tracker.len(),
                    "grace period exceeded, dropping remaining connections"
                )
            });
        }
        Ok(())
    }
}

async fn serve_connection<I>(
    io: I,
    router: Router,
    shutdown: CancellationToken,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), TowerToHyperService::new(router));
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    }
}

fn load_tls_acceptor(files: &TlsFiles) -> Result<tokio_native_tls::TlsAcceptor> {
    let cert = std::fs::read(&files.cert_file).map_err(|e| {
        Error::Tls(format!(
            "failed to read certificate {}: {}",
            files.cert_file.display(),
            e
        ))
    })?;
    let key = std::fs::read(&files.key_file).map_err(|e| {
        Error::Tls(format!(
            "failed to read key {}: {}",
            files.key_file.display(),
            e
        ))
    })?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
    let acceptor = native_tls::TlsAcceptor::new(identity)?;
    Ok(tokio_native_tls::TlsAcceptor::from(acceptor))
}

struct Dispatcher {
    services: HashMap<&'static str, Arc<dyn Service>>,
    interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    descriptors: Vec<ServiceDescriptor>,
}

impl Dispatcher {
    async fn dispatch(&self, req: RpcRequest) -> std::result::Result<Value, RpcError> {
        let service: &dyn Service = match self.services.get(req.service.as_str()) {
            Some(service) => service.as_ref(),
            None => &UnknownService,
        };
        Next::new(&self.interceptors, service).run(req).await
    }
}

/// Stands in for services that are not mounted, so interceptors still see the call
struct UnknownService;

#[async_trait]
impl Service for UnknownService {
    fn name(&self) -> &'static str {
        ""
    }

    fn methods(&self) -> &'static [&'static str] {
        &[]
    }

    async fn call(
        &self,
        _ctx: CallContext,
        method: &str,
        _params: Value,
    ) -> std::result::Result<Value, RpcError> {
        Err(RpcError::MethodNotFound(method.to_string()))
    }
}

async fn handle_json_rpc(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: Bytes,
) -> Json<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return Json(JsonRpcResponse::failure(
                None,
                JsonRpcError {
                    code: codes::PARSE_ERROR,
                    message: format!("Parse error: {}", e),
                    data: None,
                },
            ));
        }
    };

    let id = request.id.clone();
    let req = RpcRequest::parse(request.jsonrpc, &request.method, request.params);
    match dispatcher.dispatch(req).await {
        Ok(result) => Json(JsonRpcResponse::success(id, result)),
        Err(e) => Json(JsonRpcResponse::failure(id, e.into())),
    }
}

async fn handle_reflection(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Vec<ServiceDescriptor>> {
    Json(dispatcher.descriptors.clone())
}
