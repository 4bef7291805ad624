//! Prometheus metrics for the RPC server

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Request counters and latency histograms, labelled by service and method
#[derive(Debug, Clone)]
pub struct RpcMetrics {
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    registry: Arc<Registry>,
}

impl RpcMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounterVec::new(
            Opts::new(
                "plugin_rpc_requests_total",
                "Total number of handled RPC requests",
            ),
            &["service", "method", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        // 1ms .. 10s
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "plugin_rpc_request_duration_seconds",
                "RPC request latency in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["service", "method"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            registry,
        })
    }

    pub fn observe(&self, service: &str, method: &str, status: &str, seconds: f64) {
        self.requests_total
            .with_label_values(&[service, method, status])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[service, method])
            .observe(seconds);
    }

    pub fn request_count(&self, service: &str, method: &str, status: &str) -> u64 {
        self.requests_total
            .with_label_values(&[service, method, status])
            .get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export in the prometheus text format
    pub fn export_text(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_export() {
        let metrics = RpcMetrics::new().unwrap();
        metrics.observe("stage", "executeStage", "ok", 0.02);
        metrics.observe("stage", "executeStage", "ok", 0.03);

        assert_eq!(metrics.request_count("stage", "executeStage", "ok"), 2);
        let text = metrics.export_text().unwrap();
        assert!(text.contains("plugin_rpc_requests_total"));
        assert!(text.contains("plugin_rpc_request_duration_seconds"));
    }
}
