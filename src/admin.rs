//! Management server: version, health, metrics and profiling hook points.
//!
//! Runs on its own port, separate from the RPC endpoint, so piped can probe
//! the plugin without going through the RPC interceptors.

use crate::error::Result;
use crate::rpc::RpcMetrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Span};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AdminState {
    name: String,
    version: String,
    metrics: Option<RpcMetrics>,
}

pub struct AdminServer {
    state: AdminState,
    bind_addr: String,
    port: u16,
    grace_period: Duration,
    logger: Span,
}

impl AdminServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            state: AdminState {
                name: name.into(),
                version: version.into(),
                metrics: None,
            },
            bind_addr: "0.0.0.0".to_string(),
            port: 0,
            grace_period: DEFAULT_GRACE_PERIOD,
            logger: Span::none(),
        }
    }

    /// Port 0 picks an ephemeral port
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

    /// Expose `/metrics` backed by the RPC metrics registry
    pub fn with_metrics(mut self, metrics: RpcMetrics) -> Self {
        self.state.metrics = Some(metrics);
        self
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/version", get(version_handler))
            .route("/healthz", get(health_handler))
            .route("/debug/pprof/", get(pprof_index_handler))
            .route("/debug/pprof/profile", get(profiling_unavailable))
            .route("/debug/pprof/trace", get(profiling_unavailable));
        if self.state.metrics.is_some() {
            router = router.route("/metrics", get(metrics_handler));
        }
        router.with_state(self.state.clone())
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind((self.bind_addr.as_str(), self.port)).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        self.logger
            .in_scope(|| info!(addr = %addr, plugin = %self.state.name, "admin server listening"));

        let graceful = {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        };
        let serve = axum::serve(listener, self.router()).with_graceful_shutdown(graceful);

        let grace_period = self.grace_period;
        tokio::select! {
            result = serve => result?,
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(grace_period).await;
            } => {
                self.logger
                    .in_scope(|| warn!(?grace_period, "admin server did not drain within the grace period"));
            }
        }

        self.logger.in_scope(|| info!("admin server stopped"));
        Ok(())
    }
}

async fn version_handler(State(state): State<AdminState>) -> impl IntoResponse {
    state.version
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn pprof_index_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        "profiles:\n  /debug/pprof/profile\n  /debug/pprof/trace\n",
    )
}

async fn profiling_unavailable() -> impl IntoResponse {
    (
        StatusCode::NOT_IMPLEMENTED,
        "profiling is not compiled into this plugin",
    )
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let Some(metrics) = state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled".to_string()).into_response();
    };
    match metrics.export_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
