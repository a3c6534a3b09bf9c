//! Background actors.
//!
//! Each actor is an independent tokio task that owns its loop and stops when
//! its [`ActorHandle`] is shut down. The stale state reaper is the only one
//! today.

pub mod reaper;

use tokio_util::sync::CancellationToken;

pub use reaper::StaleStateReaper;

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
}

impl ActorHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ActorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
