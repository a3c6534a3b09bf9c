//! Periodic eviction of idle per-user state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::session::UserId;
use crate::state::SessionStateStore;
use crate::{tglog, tglog_debug};

use super::ActorHandle;

/// Floor for the sweep period; a zero period would panic the ticker.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

pub struct StaleStateReaper {
    store: Arc<SessionStateStore>,
    ttl: Duration,
    interval: Duration,
}

impl StaleStateReaper {
    pub fn new(store: Arc<SessionStateStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            interval: Duration::from_secs(crate::config::DEFAULT_REAP_INTERVAL_SECS),
        }
    }

    /// Sweep every `interval`, never more often than [`MIN_INTERVAL`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Run one eviction pass now.
    pub fn sweep(&self) -> Vec<UserId> {
        let evicted = self.store.evict_if_stale(Utc::now(), self.ttl);
        if !evicted.is_empty() {
            tglog!(
                "Reaper evicted {} idle session(s); {} remain",
                evicted.len(),
                self.store.len()
            );
        }
        evicted
    }

    pub fn spawn(self) -> ActorHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        tglog_debug!(
            "StaleStateReaper::spawn ttl={:?} interval={:?}",
            self.ttl,
            self.interval
        );

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        tglog_debug!("StaleStateReaper cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
        });

        ActorHandle::new(cancel)
    }
}
