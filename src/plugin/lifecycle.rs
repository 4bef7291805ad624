use std::fmt;
use tokio::sync::watch;

/// Where a running plugin is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Idle,
    /// Backend connected and configuration parsed
    ContextBuilt,
    /// Shared context assembled, initializers running
    Initializing,
    /// Admin server, log persister and RPC server running
    Serving,
    /// Shutdown started, subsystems draining
    Draining,
    Terminated,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Terminated | LifecycleState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::ContextBuilt => "context-built",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Serving => "serving",
            LifecycleState::Draining => "draining",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes state changes to any number of observers.
///
/// Terminal states are absorbing: once `Terminated` or `Failed` is published,
/// later transitions are ignored.
#[derive(Debug)]
pub(crate) struct StateTracker {
    sender: watch::Sender<LifecycleState>,
}

impl StateTracker {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(LifecycleState::Idle);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.sender.subscribe()
    }

    pub(crate) fn current(&self) -> LifecycleState {
        *self.sender.borrow()
    }

    pub(crate) fn transition(&self, next: LifecycleState) {
        self.sender.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            tracing::debug!(from = %state, to = %next, "lifecycle transition");
            *state = next;
            true
        });
    }

    /// Back to `Idle` so a finished plugin can be started again
    pub(crate) fn reset(&self) {
        self.sender.send_replace(LifecycleState::Idle);
    }
}
