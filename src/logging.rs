//! Process-wide logging setup.
//!
//! Plugins log through `tracing`. Each role adapter and the initializer get
//! their own span so that records can be told apart without a logger
//! hierarchy.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log record encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogEncoding {
    /// Human readable, one line per record
    #[default]
    Console,
    /// One JSON object per record
    Json,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Output encoding
    pub encoding: LogEncoding,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            encoding: LogEncoding::Console,
        }
    }
}

impl LogConfig {
    /// Set the log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Set the encoding
    pub fn with_encoding(mut self, encoding: LogEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// `RUST_LOG` wins over the configured level when set.
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize the global subscriber.
///
/// Records are written through a non-blocking stdout writer; the returned guard
/// must be held until the process exits so buffered records get flushed.
pub fn init_logging(config: &LogConfig) -> Result<WorkerGuard> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let layer = match config.encoding {
        LogEncoding::Console => fmt::layer()
            .with_writer(writer)
            .with_target(false)
            .boxed(),
        LogEncoding::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(layer)
        .try_init()?;

    Ok(guard)
}
