use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::gate::{GateSlot, PermissionResponse, PlanResponse};
use crate::orchestration::ExecutionClient;
use crate::session::{
    PermissionRequest, PlanApprovalRequest, QuestionRequest, SessionSnapshot, TaskId, TaskStatus,
    UserId,
};
use crate::{tglog_debug, Error, Result};

/// Mutable per-user state. Only reachable through [`SessionStateStore`],
/// which holds the session's lock for the duration of every access.
pub struct UserSession {
    pub(crate) user_id: UserId,
    pub(crate) task_id: Option<TaskId>,
    pub(crate) status: TaskStatus,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) resumed_session_id: Option<String>,
    pub(crate) last_session_id: Option<String>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) last_activity: DateTime<Utc>,
    pub(crate) trust_override: Option<bool>,
    pub(crate) permission: GateSlot<PermissionRequest, PermissionResponse>,
    pub(crate) question: GateSlot<QuestionRequest, String>,
    pub(crate) plan: GateSlot<PlanApprovalRequest, PlanResponse>,
    pub(crate) cancel: CancellationToken,
    pub(crate) client: Option<Arc<dyn ExecutionClient>>,
    pub(crate) supervisor: Option<AbortHandle>,
    evicted: bool,
}

/// What a cancellation has to stop outside the session lock.
pub(crate) struct CancelTargets {
    pub task_id: Option<TaskId>,
    pub client: Option<Arc<dyn ExecutionClient>>,
    pub supervisor: Option<AbortHandle>,
}

impl UserSession {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            task_id: None,
            status: TaskStatus::Idle,
            working_dir: None,
            resumed_session_id: None,
            last_session_id: None,
            started_at: None,
            last_activity: Utc::now(),
            trust_override: None,
            permission: GateSlot::default(),
            question: GateSlot::default(),
            plan: GateSlot::default(),
            cancel: CancellationToken::new(),
            client: None,
            supervisor: None,
            evicted: false,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn trust_override(&self) -> Option<bool> {
        self.trust_override
    }

    pub fn last_session_id(&self) -> Option<&str> {
        self.last_session_id.as_deref()
    }

    pub fn is_current(&self, task_id: TaskId) -> bool {
        self.task_id == Some(task_id)
    }

    pub fn has_pending_gate(&self) -> bool {
        self.permission.is_pending() || self.question.is_pending() || self.plan.is_pending()
    }

    /// Claim the session for a new task and hand back its cancellation token.
    ///
    /// Whatever the previous task left behind is dropped. The trust override
    /// and the last completed session id survive.
    pub(crate) fn reset_for_new_task(
        &mut self,
        task_id: TaskId,
        working_dir: Option<PathBuf>,
        resume_session_id: Option<String>,
    ) -> CancellationToken {
        self.cancel.cancel();
        self.clear_gates();
        self.cancel = CancellationToken::new();
        self.task_id = Some(task_id);
        self.status = TaskStatus::Running;
        self.working_dir = working_dir;
        self.resumed_session_id = resume_session_id;
        self.started_at = Some(Utc::now());
        self.client = None;
        self.supervisor = None;
        self.cancel.clone()
    }

    pub(crate) fn clear_gates(&mut self) {
        self.permission.clear();
        self.question.clear();
        self.plan.clear();
    }

    /// Recompute the status from the gates still pending. Terminal and idle
    /// statuses are left alone.
    pub(crate) fn refresh_status(&mut self) {
        if !self.status.is_active() {
            return;
        }
        self.status = if self.permission.is_pending() || self.plan.is_pending() {
            TaskStatus::WaitingPermission
        } else if self.question.is_pending() {
            TaskStatus::WaitingAnswer
        } else {
            TaskStatus::Running
        };
    }

    /// Detach the running task, leaving the session idle.
    ///
    /// Returns `None` when nothing is running.
    pub(crate) fn take_for_cancel(&mut self) -> Option<CancelTargets> {
        if self.task_id.is_none() && !self.status.is_active() {
            return None;
        }
        let task_id = self.task_id.take();
        self.cancel.cancel();
        self.clear_gates();
        self.status = TaskStatus::Idle;
        Some(CancelTargets {
            task_id,
            client: self.client.take(),
            supervisor: self.supervisor.take(),
        })
    }

    /// Record the live client for `task_id`. Refused if the task is stale.
    pub(crate) fn attach_client(&mut self, task_id: TaskId, client: Arc<dyn ExecutionClient>) -> bool {
        if !self.is_current(task_id) {
            return false;
        }
        self.client = Some(client);
        true
    }

    pub(crate) fn attach_supervisor(&mut self, task_id: TaskId, handle: AbortHandle) -> bool {
        if !self.is_current(task_id) {
            return false;
        }
        self.supervisor = Some(handle);
        true
    }

    /// Move `task_id` to a terminal status. Returns `false` if it was
    /// already superseded, in which case nothing is touched.
    pub(crate) fn finish(
        &mut self,
        task_id: TaskId,
        status: TaskStatus,
        session_id: Option<String>,
    ) -> bool {
        if !self.is_current(task_id) {
            return false;
        }
        self.task_id = None;
        self.status = status;
        if session_id.is_some() {
            self.last_session_id = session_id;
        }
        self.clear_gates();
        self.client = None;
        self.supervisor = None;
        true
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Idle with nothing pending and untouched for longer than `ttl`.
    fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let idle_for = now
            .signed_duration_since(self.last_activity)
            .to_std()
            .unwrap_or_default();
        self.task_id.is_none()
            && self.status.is_idle()
            && !self.has_pending_gate()
            && idle_for > ttl
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user_id: self.user_id,
            task_id: self.task_id,
            status: self.status,
            working_dir: self.working_dir.clone(),
            resumed_session_id: self.resumed_session_id.clone(),
            last_session_id: self.last_session_id.clone(),
            started_at: self.started_at,
            last_activity: self.last_activity,
            trust_override: self.trust_override,
            has_pending_permission: self.permission.is_pending(),
            has_pending_question: self.question.is_pending(),
            has_pending_plan: self.plan.is_pending(),
        }
    }
}

fn lock(session: &Mutex<UserSession>) -> MutexGuard<'_, UserSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map from user to that user's session, each behind its own lock.
///
/// Operations on one user never block on another user's lock. No lock is
/// ever held across an await point.
#[derive(Default)]
pub struct SessionStateStore {
    sessions: RwLock<HashMap<UserId, Arc<Mutex<UserSession>>>>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, user: UserId) -> Option<Arc<Mutex<UserSession>>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .cloned()
    }

    fn get_or_create(&self, user: UserId) -> Arc<Mutex<UserSession>> {
        if let Some(existing) = self.entry(user) {
            return existing;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(user)
            .or_insert_with(|| {
                tglog_debug!("Creating session for user {}", user);
                Arc::new(Mutex::new(UserSession::new(user)))
            })
            .clone()
    }

    /// Run `f` under the user's lock, creating the session on first use.
    pub fn with_user<R>(&self, user: UserId, f: impl FnOnce(&mut UserSession) -> R) -> R {
        loop {
            let entry = self.get_or_create(user);
            let mut session = lock(&entry);
            if session.evicted {
                // Lost a race with the reaper; the map now has a fresh slot.
                continue;
            }
            session.touch();
            return f(&mut session);
        }
    }

    /// Run `f` under the user's lock if the user has a session.
    pub fn with_existing<R>(
        &self,
        user: UserId,
        f: impl FnOnce(&mut UserSession) -> R,
    ) -> Result<R> {
        let entry = self.entry(user).ok_or(Error::SessionNotFound(user))?;
        let mut session = lock(&entry);
        if session.evicted {
            return Err(Error::SessionNotFound(user));
        }
        session.touch();
        Ok(f(&mut session))
    }

    /// Read without refreshing the session's activity time.
    pub fn read_user<R>(&self, user: UserId, f: impl FnOnce(&UserSession) -> R) -> Option<R> {
        let entry = self.entry(user)?;
        let session = lock(&entry);
        if session.evicted {
            return None;
        }
        Some(f(&session))
    }

    pub fn get(&self, user: UserId) -> Result<SessionSnapshot> {
        self.snapshot(user).ok_or(Error::SessionNotFound(user))
    }

    pub fn snapshot(&self, user: UserId) -> Option<SessionSnapshot> {
        self.read_user(user, UserSession::snapshot)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.read_user(user, |_| ()).is_some()
    }

    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop sessions that are idle and have been inactive longer than `ttl`.
    ///
    /// Sessions whose lock is currently held are skipped for this round.
    pub fn evict_if_stale(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<UserId> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let mut evicted = Vec::new();
        sessions.retain(|user, entry| {
            let mut session = match entry.try_lock() {
                Ok(session) => session,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return true,
            };
            if session.is_stale(now, ttl) {
                session.evicted = true;
                evicted.push(*user);
                false
            } else {
                true
            }
        });
        evicted.sort();
        evicted
    }
}
