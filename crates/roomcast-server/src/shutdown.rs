//! Shutdown state machine and the cancellation tokens it drives.

use parking_lot::Mutex;
use roomcast_core::RelayError;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Node lifecycle: `Running → Draining → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Accepting connections.
    Running,
    /// Shutdown in progress; new connections are refused.
    Draining,
    /// Shutdown finished (or gave up at the deadline).
    Stopped,
}

/// Owns the node state and the two node-wide tokens.
///
/// `accept` stops the listener; `shutdown` is observed by every
/// per-connection task. Both fire only through [`ShutdownCoordinator::begin`].
pub struct ShutdownCoordinator {
    state: Mutex<NodeState>,
    accept: CancellationToken,
    shutdown: CancellationToken,
}

impl ShutdownCoordinator {
    /// A coordinator in the `Running` state.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NodeState::Running),
            accept: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.state() != NodeState::Running
    }

    /// Token cancelled when the listener must stop accepting.
    pub fn accept_token(&self) -> CancellationToken {
        self.accept.clone()
    }

    /// Token cancelled when per-connection tasks must exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Move to `Draining`, stop accepting, then raise the shutdown signal.
    ///
    /// Only the first call succeeds.
    pub fn begin(&self) -> Result<(), RelayError> {
        {
            let mut state = self.state.lock();
            if *state != NodeState::Running {
                return Err(RelayError::AlreadyShuttingDown);
            }
            *state = NodeState::Draining;
        }
        info!("shutdown started, draining");
        self.accept.cancel();
        self.shutdown.cancel();
        Ok(())
    }

    /// Move to `Stopped`.
    pub fn finish(&self) {
        *self.state.lock() = NodeState::Stopped;
        info!("shutdown finished");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
