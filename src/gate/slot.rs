use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::session::TaskId;

struct Pending<Req, Resp> {
    task_id: TaskId,
    request: Req,
    responder: oneshot::Sender<Resp>,
}

/// Storage for at most one pending request of a gate kind.
///
/// The slot records which task opened it; a response is only delivered while
/// that task is still the session's current task.
pub struct GateSlot<Req, Resp> {
    pending: Option<Pending<Req, Resp>>,
}

impl<Req, Resp> Default for GateSlot<Req, Resp> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl<Req, Resp> GateSlot<Req, Resp> {
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn request(&self) -> Option<&Req> {
        self.pending.as_ref().map(|p| &p.request)
    }

    pub fn pending_task(&self) -> Option<TaskId> {
        self.pending.as_ref().map(|p| p.task_id)
    }

    /// Store `request` and hand back the receiving end of its response.
    ///
    /// Returns `None` if `task_id` already has a request pending here. A
    /// leftover request from another task is dropped, waking its waiter.
    pub(crate) fn arm(&mut self, task_id: TaskId, request: Req) -> Option<oneshot::Receiver<Resp>> {
        if self.pending_task() == Some(task_id) {
            return None;
        }
        let (responder, receiver) = oneshot::channel();
        self.pending = Some(Pending {
            task_id,
            request,
            responder,
        });
        Some(receiver)
    }

    /// Deliver `response` if the pending request belongs to `current`.
    ///
    /// The request is consumed either way it lands, so a second response
    /// for the same request finds nothing and returns `false`.
    pub(crate) fn resolve(&mut self, current: Option<TaskId>, response: Resp) -> bool {
        match (&self.pending, current) {
            (Some(p), Some(current)) if p.task_id == current => {}
            _ => return false,
        }
        match self.pending.take() {
            Some(p) => p.responder.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop the pending request if it belongs to `task_id`.
    pub(crate) fn release(&mut self, task_id: TaskId) -> bool {
        if self.pending_task() == Some(task_id) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Drop whatever is pending. The waiter observes a closed channel.
    pub(crate) fn clear(&mut self) -> bool {
        self.pending.take().is_some()
    }
}

/// The waiting side of an opened gate.
pub struct GateTicket<Resp> {
    pub(crate) task_id: TaskId,
    pub(crate) cancel: CancellationToken,
    pub(crate) receiver: oneshot::Receiver<Resp>,
}
