use std::sync::Arc;

use crate::session::UserId;
use crate::state::SessionStateStore;
use crate::{tglog, tglog_debug, tglog_error};

/// Stops a user's current task.
///
/// The task id is invalidated, every gate wait is woken and the session goes
/// idle in one locked step. The backend interrupt and the supervisor abort
/// happen afterwards, outside the lock.
#[derive(Clone)]
pub struct CancellationController {
    store: Arc<SessionStateStore>,
}

impl CancellationController {
    pub fn new(store: Arc<SessionStateStore>) -> Self {
        Self { store }
    }

    /// Returns `false` when the user had nothing running. Safe to repeat.
    pub async fn cancel(&self, user: UserId) -> bool {
        let targets = self
            .store
            .with_existing(user, |session| session.take_for_cancel())
            .ok()
            .flatten();

        let Some(targets) = targets else {
            tglog_debug!("Cancel for user {}: nothing running", user);
            return false;
        };

        match targets.task_id {
            Some(task_id) => tglog!("Cancelling task {} for user {}", task_id.short(), user),
            None => tglog!("Cancelling orphaned activity for user {}", user),
        }

        if let Some(client) = targets.client {
            if let Err(e) = client.interrupt().await {
                tglog_error!("Interrupt failed for user {}: {}", user, e);
            }
        }
        if let Some(supervisor) = targets.supervisor {
            supervisor.abort();
        }
        true
    }
}
