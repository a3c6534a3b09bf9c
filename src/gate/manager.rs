use std::sync::Arc;
use std::time::Duration;

use crate::session::{TaskId, UserId};
use crate::state::SessionStateStore;
use crate::{tglog, tglog_debug, Error, Result};

use super::{GateKind, GateOutcome, GateTicket};

/// Opens, resolves and waits on gates stored in the session state store.
#[derive(Clone)]
pub struct GateManager {
    store: Arc<SessionStateStore>,
}

impl GateManager {
    pub fn new(store: Arc<SessionStateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SessionStateStore> {
        &self.store
    }

    /// Arm a gate for `task_id` and move the session into the gate's waiting
    /// status. Fails with [`Error::StaleTask`] if the task is no longer the
    /// session's current task.
    pub fn open<K: GateKind>(
        &self,
        user: UserId,
        task_id: TaskId,
        request: K::Request,
    ) -> Result<GateTicket<K::Response>> {
        self.store.with_existing(user, |session| {
            if !session.is_current(task_id) {
                return Err(Error::StaleTask);
            }
            let receiver = K::slot(session)
                .arm(task_id, request)
                .ok_or(Error::GateBusy(K::TYPE))?;
            session.status = K::waiting_status();
            tglog_debug!("Opened {} gate for user {} task {}", K::TYPE, user, task_id.short());
            Ok(GateTicket {
                task_id,
                cancel: session.cancel.clone(),
                receiver,
            })
        })?
    }

    /// Deliver a human response. Returns `false` when nothing matching is
    /// pending: no session, no request, a stale task, or a second response.
    pub fn respond<K: GateKind>(&self, user: UserId, response: K::Response) -> bool {
        let delivered = self
            .store
            .with_existing(user, |session| {
                let current = session.task_id;
                let delivered = K::slot(session).resolve(current, response);
                if delivered {
                    session.refresh_status();
                }
                delivered
            })
            .unwrap_or(false);

        if delivered {
            tglog!("Resolved {} gate for user {}", K::TYPE, user);
        } else {
            tglog_debug!("Ignoring stale {} response for user {}", K::TYPE, user);
        }
        delivered
    }

    /// Resolve the pending request with the gate's trust-mode response.
    /// Gates without one, such as plan review, are left pending.
    pub fn auto_resolve<K: GateKind>(&self, user: UserId) -> bool {
        self.store
            .with_existing(user, |session| {
                let Some(response) = K::slot_ref(session).request().and_then(K::auto_response)
                else {
                    return false;
                };
                let current = session.task_id;
                let delivered = K::slot(session).resolve(current, response);
                if delivered {
                    tglog_debug!("Auto-resolved {} gate for user {}", K::TYPE, user);
                    session.refresh_status();
                }
                delivered
            })
            .unwrap_or(false)
    }

    /// Suspend until the gate is resolved, times out or its task is cancelled.
    ///
    /// Cancellation wins over a response that arrives at the same instant. A
    /// response that lands as the timer fires is kept rather than discarded.
    pub async fn wait<K: GateKind>(
        &self,
        user: UserId,
        ticket: GateTicket<K::Response>,
        timeout: Duration,
    ) -> GateOutcome<K::Response> {
        let GateTicket {
            task_id,
            cancel,
            mut receiver,
        } = ticket;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => GateOutcome::Cancelled,
            result = &mut receiver => match result {
                Ok(response) => GateOutcome::Resolved(response),
                Err(_) => GateOutcome::Cancelled,
            },
            _ = tokio::time::sleep(timeout) => {
                // Responders send under the session lock, so once the slot is
                // released here the channel holds any response that won.
                let _ = self
                    .store
                    .with_existing(user, |session| K::slot(session).release(task_id));
                match receiver.try_recv() {
                    Ok(response) => GateOutcome::Resolved(response),
                    Err(_) => {
                        tglog!("{} gate timed out for user {} after {:?}", K::TYPE, user, timeout);
                        GateOutcome::TimedOut
                    }
                }
            }
        };

        let still_current = self
            .store
            .with_existing(user, |session| {
                if !session.is_current(task_id) {
                    return false;
                }
                K::slot(session).release(task_id);
                session.refresh_status();
                true
            })
            .unwrap_or(false);

        if !still_current || cancel.is_cancelled() {
            tglog_debug!("{} gate for user {} ended by cancellation", K::TYPE, user);
            return GateOutcome::Cancelled;
        }
        outcome
    }

    /// The pending request of kind `K`, if any.
    pub fn pending<K: GateKind>(&self, user: UserId) -> Option<K::Request> {
        self.store
            .read_user(user, |session| K::slot_ref(session).request().cloned())
            .flatten()
    }

    pub fn is_current(&self, user: UserId, task_id: TaskId) -> bool {
        self.store
            .read_user(user, |session| session.is_current(task_id))
            .unwrap_or(false)
    }
}
