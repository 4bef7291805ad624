//! Stage log shipping.
//!
//! Stage executions write log lines through a [`StageLogPersister`]. Lines are
//! buffered per stage and shipped to piped by [`Persister::run`], which flushes
//! periodically, whenever a stage completes, and once more on shutdown.

use crate::client::{LogBlock, LogSeverity, PluginServiceClient, ReportStageLogsRequest};
use crate::error::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Blocks kept per stage while piped is not accepting them
pub const DEFAULT_MAX_BUFFERED_BLOCKS: usize = 10_000;

/// Hands out per-stage log writers
pub trait LogPersister: Send + Sync {
    fn stage_log_persister(&self, deployment_id: &str, stage_id: &str) -> Arc<dyn StageLogPersister>;
}

/// Log writer bound to one stage of one deployment
pub trait StageLogPersister: Send + Sync {
    fn write(&self, severity: LogSeverity, log: &str);

    /// Mark the stage log as finished and request an immediate flush
    fn complete(&self);

    fn info(&self, log: &str) {
        self.write(LogSeverity::Info, log);
    }

    fn success(&self, log: &str) {
        self.write(LogSeverity::Success, log);
    }

    fn error(&self, log: &str) {
        self.write(LogSeverity::Error, log);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StageKey {
    deployment_id: String,
    stage_id: String,
}

#[derive(Debug)]
enum Record {
    Append(StageKey, LogBlock),
    Complete(StageKey),
}

/// Buffers stage logs and forwards them to piped
pub struct Persister {
    client: Arc<dyn PluginServiceClient>,
    sender: mpsc::UnboundedSender<Record>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Record>>>,
    flush_interval: Duration,
    grace_period: Duration,
    max_buffered_blocks: usize,
    logger: Span,
}

impl Persister {
    pub fn new(client: Arc<dyn PluginServiceClient>, logger: Span) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            client,
            sender,
            receiver: Mutex::new(Some(receiver)),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_buffered_blocks: DEFAULT_MAX_BUFFERED_BLOCKS,
            logger,
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Oldest blocks of a stage are dropped beyond this many
    pub fn with_max_buffered_blocks(mut self, max: usize) -> Self {
        self.max_buffered_blocks = max.max(1);
        self
    }

    /// Ship buffered logs until `shutdown` is cancelled, then flush what is left.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::Internal("log persister is already running".to_string()))?;

        self.logger
            .in_scope(|| info!(flush_interval = ?self.flush_interval, "log persister started"));

        let mut buffers: HashMap<StageKey, Vec<LogBlock>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.flush_all(&mut buffers, &shutdown).await,
                record = receiver.recv() => match record {
                    Some(Record::Append(key, block)) => self.append(&mut buffers, key, block),
                    Some(Record::Complete(key)) => {
                        if let Some(blocks) = buffers.remove(&key) {
                            if let Err(blocks) = self.flush(&key, blocks, &shutdown).await {
                                self.requeue(&mut buffers, key, blocks);
                            }
                        }
                    }
                    // all senders gone; only reachable once the persister itself is dropped
                    None => break,
                },
            }
        }

        while let Ok(record) = receiver.try_recv() {
            if let Record::Append(key, block) = record {
                self.append(&mut buffers, key, block);
            }
        }

        let pending: usize = buffers.values().map(Vec::len).sum();
        self.logger
            .in_scope(|| info!(pending, "log persister stopping, flushing remaining logs"));
        // the shutdown token is already cancelled; the final flush is bounded by the grace period
        let draining = CancellationToken::new();
        if tokio::time::timeout(self.grace_period, self.flush_all(&mut buffers, &draining))
            .await
            .is_err()
        {
            let dropped: usize = buffers.values().map(Vec::len).sum();
            self.logger
                .in_scope(|| warn!(dropped, "grace period exceeded while flushing stage logs"));
        }
        Ok(())
    }

    fn append(&self, buffers: &mut HashMap<StageKey, Vec<LogBlock>>, key: StageKey, block: LogBlock) {
        let buffer = buffers.entry(key).or_default();
        buffer.push(block);
        let dropped = self.trim(buffer);
        if dropped > 0 {
            debug!(dropped, "stage log buffer is full, dropping the oldest log");
        }
    }

    /// Put blocks that could not be shipped back in front of newer ones.
    fn requeue(&self, buffers: &mut HashMap<StageKey, Vec<LogBlock>>, key: StageKey, blocks: Vec<LogBlock>) {
        let buffer = buffers.entry(key.clone()).or_default();
        buffer.splice(0..0, blocks);
        let dropped = self.trim(buffer);
        if dropped > 0 {
            self.logger.in_scope(|| {
                warn!(
                    deployment_id = %key.deployment_id,
                    stage_id = %key.stage_id,
                    dropped,
                    "stage log buffer is full, dropping the oldest logs"
                )
            });
        }
    }

    /// Drop the oldest blocks beyond the cap and return how many went.
    fn trim(&self, buffer: &mut Vec<LogBlock>) -> usize {
        let dropped = buffer.len().saturating_sub(self.max_buffered_blocks);
        buffer.drain(..dropped);
        dropped
    }

    /// Stops early, leaving the rest buffered, once `stop` is cancelled.
    async fn flush_all(&self, buffers: &mut HashMap<StageKey, Vec<LogBlock>>, stop: &CancellationToken) {
        let keys: Vec<StageKey> = buffers.keys().cloned().collect();
        for key in keys {
            if stop.is_cancelled() {
                return;
            }
            if let Some(blocks) = buffers.remove(&key) {
                if blocks.is_empty() {
                    continue;
                }
                if let Err(blocks) = self.flush(&key, blocks, stop).await {
                    self.requeue(buffers, key, blocks);
                }
            }
        }
    }

    /// Returns the blocks back when shipping failed or was interrupted by `stop`
    /// so they can be retried.
    async fn flush(
        &self,
        key: &StageKey,
        blocks: Vec<LogBlock>,
        stop: &CancellationToken,
    ) -> std::result::Result<(), Vec<LogBlock>> {
        let count = blocks.len();
        let request = ReportStageLogsRequest {
            deployment_id: key.deployment_id.clone(),
            stage_id: key.stage_id.clone(),
            retried_count: 0,
            blocks: blocks.clone(),
        };
        let result = tokio::select! {
            result = self.client.report_stage_logs(request) => result,
            _ = stop.cancelled() => {
                debug!(
                    deployment_id = %key.deployment_id,
                    stage_id = %key.stage_id,
                    count,
                    "stage log flush interrupted by shutdown"
                );
                return Err(blocks);
            }
        };
        match result {
            Ok(()) => {
                debug!(
                    deployment_id = %key.deployment_id,
                    stage_id = %key.stage_id,
                    count,
                    "flushed stage logs"
                );
                Ok(())
            }
            Err(e) => {
                self.logger.in_scope(|| {
                    warn!(
                        deployment_id = %key.deployment_id,
                        stage_id = %key.stage_id,
                        error = %e,
                        "failed to report stage logs"
                    )
                });
                Err(blocks)
            }
        }
    }
}

impl LogPersister for Persister {
    fn stage_log_persister(&self, deployment_id: &str, stage_id: &str) -> Arc<dyn StageLogPersister> {
        Arc::new(StageLogWriter {
            key: StageKey {
                deployment_id: deployment_id.to_string(),
                stage_id: stage_id.to_string(),
            },
            sender: self.sender.clone(),
            next_index: AtomicU64::new(0),
            completed: AtomicBool::new(false),
        })
    }
}

struct StageLogWriter {
    key: StageKey,
    sender: mpsc::UnboundedSender<Record>,
    next_index: AtomicU64,
    completed: AtomicBool,
}

impl StageLogPersister for StageLogWriter {
    fn write(&self, severity: LogSeverity, log: &str) {
        if self.completed.load(Ordering::Acquire) {
            debug!(stage_id = %self.key.stage_id, "dropping log written after completion");
            return;
        }
        let block = LogBlock {
            index: self.next_index.fetch_add(1, Ordering::SeqCst),
            log: log.to_string(),
            severity,
            created_at: Utc::now(),
        };
        if self
            .sender
            .send(Record::Append(self.key.clone(), block))
            .is_err()
        {
            debug!(stage_id = %self.key.stage_id, "log persister stopped, dropping log");
        }
    }

    fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(Record::Complete(self.key.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InstallToolRequest, InstallToolResponse};
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingClient {
        reports: AsyncMutex<Vec<ReportStageLogsRequest>>,
        fail: AtomicBool,
        attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl PluginServiceClient for RecordingClient {
        async fn report_stage_logs(&self, request: ReportStageLogsRequest) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Internal("unavailable".to_string()));
            }
            self.reports.lock().await.push(request);
            Ok(())
        }

        async fn install_tool(&self, _request: InstallToolRequest) -> Result<InstallToolResponse> {
            Err(Error::Internal("unused".to_string()))
        }
    }

    fn all_logs(reports: &[ReportStageLogsRequest]) -> Vec<String> {
        reports
            .iter()
            .flat_map(|r| r.blocks.iter().map(|b| b.log.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_flush_on_shutdown() {
        let client = Arc::new(RecordingClient::default());
        let persister = Arc::new(
            Persister::new(client.clone(), Span::none())
                .with_flush_interval(Duration::from_secs(3600)),
        );
        let shutdown = CancellationToken::new();
        let handle = {
            let persister = persister.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { persister.run(shutdown).await })
        };

        let stage = persister.stage_log_persister("deployment-1", "stage-1");
        stage.info("starting");
        stage.success("done");

        tokio::task::yield_now().await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let reports = client.reports.lock().await;
        assert_eq!(all_logs(&reports), vec!["starting", "done"]);
        assert_eq!(reports[0].deployment_id, "deployment-1");
        assert_eq!(reports[0].blocks[0].index, 0);
        assert_eq!(reports[0].blocks[1].index, 1);
        assert_eq!(reports[0].blocks[1].severity, LogSeverity::Success);
    }

    #[tokio::test]
    async fn test_complete_flushes_immediately() {
        let client = Arc::new(RecordingClient::default());
        let persister = Arc::new(
            Persister::new(client.clone(), Span::none())
                .with_flush_interval(Duration::from_secs(3600)),
        );
        let shutdown = CancellationToken::new();
        let handle = {
            let persister = persister.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { persister.run(shutdown).await })
        };

        let stage = persister.stage_log_persister("d", "s");
        stage.error("failed to apply");
        stage.complete();
        // written after completion, must be dropped
        stage.info("late");

        for _ in 0..50 {
            if !client.reports.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(all_logs(&client.reports.lock().await), vec!["failed to apply"]);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(client.reports.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried() {
        let client = Arc::new(RecordingClient::default());
        client.fail.store(true, Ordering::SeqCst);
        let persister = Arc::new(
            Persister::new(client.clone(), Span::none())
                .with_flush_interval(Duration::from_millis(10)),
        );
        let shutdown = CancellationToken::new();
        let handle = {
            let persister = persister.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { persister.run(shutdown).await })
        };

        persister.stage_log_persister("d", "s").info("kept");
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.fail.store(false, Ordering::SeqCst);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(all_logs(&client.reports.lock().await), vec!["kept"]);
    }

    /// Never answers, like a piped that stopped responding
    struct HangingClient;

    #[async_trait]
    impl PluginServiceClient for HangingClient {
        async fn report_stage_logs(&self, _request: ReportStageLogsRequest) -> Result<()> {
            std::future::pending().await
        }

        async fn install_tool(&self, _request: InstallToolRequest) -> Result<InstallToolResponse> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_hung_piped_does_not_block_shutdown() {
        let persister = Arc::new(
            Persister::new(Arc::new(HangingClient), Span::none())
                .with_flush_interval(Duration::from_millis(20))
                .with_grace_period(Duration::from_millis(100)),
        );
        let shutdown = CancellationToken::new();
        let handle = {
            let persister = persister.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { persister.run(shutdown).await })
        };

        persister.stage_log_persister("d", "s").info("never delivered");
        // let a periodic flush start and hang
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("persister ignored the grace period");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_buffer_keeps_newest_blocks_while_piped_fails() {
        let client = Arc::new(RecordingClient::default());
        client.fail.store(true, Ordering::SeqCst);
        let persister = Arc::new(
            Persister::new(client.clone(), Span::none())
                .with_flush_interval(Duration::from_secs(3600))
                .with_max_buffered_blocks(5),
        );
        let shutdown = CancellationToken::new();
        let handle = {
            let persister = persister.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { persister.run(shutdown).await })
        };

        let stage = persister.stage_log_persister("d", "s");
        for i in 0..8 {
            stage.info(&format!("line-{}", i));
        }
        stage.complete();

        for _ in 0..100 {
            if client.attempts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.attempts.load(Ordering::SeqCst) > 0);
        client.fail.store(false, Ordering::SeqCst);

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let reports = client.reports.lock().await;
        assert_eq!(
            all_logs(&reports),
            vec!["line-3", "line-4", "line-5", "line-6", "line-7"]
        );
        assert_eq!(reports[0].blocks[0].index, 3);
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let client = Arc::new(RecordingClient::default());
        let persister = Persister::new(client, Span::none());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        persister.run(shutdown.clone()).await.unwrap();
        assert!(persister.run(shutdown).await.is_err());
    }
}
