//! Runs long-lived subsystems under one cancellation domain.

use crate::error::{Error, Result};
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Fan-out/fan-in runner for the plugin's subsystems.
///
/// Every task shares one [`CancellationToken`]. The first task to fail (or
/// panic) cancels it so the others begin draining; [`Supervisor::wait`] returns
/// once all tasks have finished.
pub struct Supervisor {
    tasks: JoinSet<(&'static str, Result<()>)>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            shutdown,
        }
    }

    /// Token shared by every supervised task
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        // inner spawn so a panic is reported against the task name
        let handle = tokio::spawn(task);
        self.tasks.spawn(async move {
            match handle.await {
                Ok(result) => (name, result),
                Err(e) => (name, Err(Error::Internal(format!("task panicked: {}", e)))),
            }
        });
    }

    /// Wait for all tasks and return the first failure, if any.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let (name, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    // only reachable when the wrapper itself is aborted
                    error!(error = %e, "supervised task aborted");
                    self.shutdown.cancel();
                    continue;
                }
            };

            match result {
                Ok(()) => info!(subsystem = name, "subsystem stopped"),
                Err(e) => {
                    error!(subsystem = name, error = %e, "subsystem failed");
                    self.shutdown.cancel();
                    if first_error.is_none() {
                        first_error = Some(Error::subsystem(name, e));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
