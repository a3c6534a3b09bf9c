//! Per-user task life cycle.
//!
//! [`TaskOrchestrator::start`] owns a task from the moment it supersedes the
//! previous one until a terminal [`TaskResult`] is produced. The run itself
//! executes on a supervisor tokio task so a cancellation can abort it
//! outright; the session only ever accepts state changes from the task id
//! that is current.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::actors::{ActorHandle, StaleStateReaper};
use crate::config::Config;
use crate::gate::{
    GateManager, PermissionGate, PermissionResponse, PlanGate, PlanResponse, QuestionGate,
};
use crate::session::{
    PermissionRequest, PlanApprovalRequest, QuestionRequest, SessionSnapshot, TaskId, TaskStatus,
    UserId,
};
use crate::state::SessionStateStore;
use crate::{tglog, tglog_debug, tglog_error, tglog_trace, tglog_warn, Error};

use super::cancel::CancellationController;
use super::client::{ClientFactory, Completion, ExecutionEvent, RunRequest, ToolCallHandler};
use super::notify::{Notification, NotificationSink};
use super::tool_gate::TaskToolGate;

/// What to run for a user.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub prompt: String,
    /// Falls back to the configured working root.
    pub working_dir: Option<PathBuf>,
    pub resume_session_id: Option<String>,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: None,
            resume_session_id: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }
}

/// Terminal outcome of one `start` call. Always produced, whatever happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub output: String,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
    /// Backend runs made, counting the zero-turn retry.
    pub attempts: u32,
}

impl TaskResult {
    fn new(task_id: TaskId, status: TaskStatus, attempts: u32) -> Self {
        Self {
            task_id,
            status,
            output: String::new(),
            session_id: None,
            error: None,
            cost_usd: None,
            num_turns: None,
            duration_ms: None,
            attempts,
        }
    }

    fn failed(task_id: TaskId, error: String, attempts: u32) -> Self {
        Self {
            error: Some(error),
            ..Self::new(task_id, TaskStatus::Failed, attempts)
        }
    }

    fn cancelled(task_id: TaskId, attempts: u32) -> Self {
        Self::new(task_id, TaskStatus::Cancelled, attempts)
    }

    fn completed(task_id: TaskId, output: String, completion: Completion, attempts: u32) -> Self {
        let (status, error) = if completion.is_error {
            let message = completion
                .result
                .clone()
                .unwrap_or_else(|| "Execution ended with an error".to_string());
            (TaskStatus::Failed, Some(message))
        } else {
            (TaskStatus::Completed, None)
        };
        Self {
            status,
            output,
            error,
            session_id: completion.session_id,
            cost_usd: completion.cost_usd,
            num_turns: completion.num_turns,
            duration_ms: completion.duration_ms,
            ..Self::new(task_id, TaskStatus::Completed, attempts)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// The backend finished without taking a turn, successfully or not.
    fn is_zero_turn(&self) -> bool {
        self.status != TaskStatus::Cancelled && self.num_turns == Some(0)
    }
}

/// Text blocks joined by newline, then the completion's result text.
fn join_output(blocks: &[String], result: Option<&str>) -> String {
    let mut output = blocks.join("\n");
    if let Some(result) = result.filter(|r| !r.is_empty()) {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(result);
    }
    output
}

/// Everything one supervised run needs, owned so it can move onto a task.
struct TaskRun {
    user: UserId,
    task_id: TaskId,
    prompt: String,
    working_dir: PathBuf,
    resume_session_id: Option<String>,
    cancel: CancellationToken,
    config: Arc<Config>,
    gates: GateManager,
    factory: Arc<dyn ClientFactory>,
    sink: Arc<dyn NotificationSink>,
}

impl TaskRun {
    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || !self.gates.is_current(self.user, self.task_id)
    }

    async fn execute(self) -> TaskResult {
        let mut resume = self.resume_session_id.clone();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self.attempt(resume.clone(), attempts).await;

            if result.is_zero_turn() && resume.is_some() && attempts == 1 {
                tglog_warn!(
                    "Zero-turn completion resuming session {} for user {}; retrying without resume",
                    resume.as_deref().unwrap_or_default(),
                    self.user
                );
                resume = None;
                continue;
            }
            if result.is_zero_turn() && attempts > 1 {
                tglog_warn!("Task {} still ended with zero turns after retry", self.task_id.short());
            }
            if let Some(error) = &result.error {
                self.sink.notify(self.user, Notification::Error(error.clone()));
            }
            return result;
        }
    }

    fn client_failure(&self, err: Error, attempts: u32) -> TaskResult {
        let message = err.to_string();
        tglog_error!("Execution failed for user {}: {}", self.user, message);
        TaskResult::failed(self.task_id, message, attempts)
    }

    async fn attempt(&self, resume: Option<String>, attempts: u32) -> TaskResult {
        if self.is_stopped() {
            return TaskResult::cancelled(self.task_id, attempts);
        }

        let client = self.factory.create(self.user);
        let attached = self
            .gates
            .store()
            .with_existing(self.user, |session| session.attach_client(self.task_id, client.clone()))
            .unwrap_or(false);
        if !attached {
            return TaskResult::cancelled(self.task_id, attempts);
        }

        let handler: Arc<dyn ToolCallHandler> = Arc::new(TaskToolGate::new(
            self.user,
            self.task_id,
            self.working_dir.clone(),
            self.cancel.clone(),
            self.gates.clone(),
            self.config.clone(),
            self.sink.clone(),
        ));
        let request = RunRequest {
            prompt: self.prompt.clone(),
            working_dir: self.working_dir.clone(),
            resume_session_id: resume,
        };

        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return TaskResult::cancelled(self.task_id, attempts),
            started = client.run(request, handler) => started,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(e) => return self.client_failure(e, attempts),
        };

        let mut blocks = Vec::new();
        let mut completion = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let mut result = TaskResult::cancelled(self.task_id, attempts);
                    result.output = blocks.join("\n");
                    return result;
                }
                next = stream.next() => next,
            };

            let event = match next {
                None => break,
                Some(Err(e)) => return self.client_failure(e, attempts),
                Some(Ok(event)) => event,
            };
            tglog_trace!("Event for user {}: {:?}", self.user, event);
            match event {
                ExecutionEvent::Text(text) => {
                    self.sink.notify(self.user, Notification::Text(text.clone()));
                    blocks.push(text);
                }
                ExecutionEvent::Thinking(text) => {
                    self.sink.notify(self.user, Notification::Thinking(text));
                }
                ExecutionEvent::ToolUse { name, input, .. } => {
                    self.sink.notify(self.user, Notification::ToolUse { name, input });
                }
                ExecutionEvent::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    self.sink.notify(
                        self.user,
                        Notification::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        },
                    );
                }
                ExecutionEvent::Completion(done) => {
                    completion = Some(done);
                    break;
                }
            }
        }

        if self.cancel.is_cancelled() {
            let mut result = TaskResult::cancelled(self.task_id, attempts);
            result.output = blocks.join("\n");
            return result;
        }
        let completion = completion.unwrap_or_default();
        let output = join_output(&blocks, completion.result.as_deref());
        TaskResult::completed(self.task_id, output, completion, attempts)
    }
}

/// Runs at most one task per user and routes human responses to it.
pub struct TaskOrchestrator {
    config: Arc<Config>,
    store: Arc<SessionStateStore>,
    gates: GateManager,
    canceller: CancellationController,
    factory: Arc<dyn ClientFactory>,
    reaper: Mutex<Option<ActorHandle>>,
}

impl TaskOrchestrator {
    pub fn new(config: Config, factory: Arc<dyn ClientFactory>) -> Self {
        let store = Arc::new(SessionStateStore::new());
        Self {
            config: Arc::new(config),
            gates: GateManager::new(store.clone()),
            canceller: CancellationController::new(store.clone()),
            store,
            factory,
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStateStore> {
        &self.store
    }

    pub fn gates(&self) -> &GateManager {
        &self.gates
    }

    /// Run a task for `user` to completion, superseding any task already
    /// running for them. Never fails: every path ends in a [`TaskResult`].
    pub async fn start(
        &self,
        user: UserId,
        request: TaskRequest,
        sink: Arc<dyn NotificationSink>,
    ) -> TaskResult {
        if self.canceller.cancel(user).await {
            tglog!("Superseded running task for user {}", user);
        }

        let task_id = TaskId::new();
        let working_dir = request
            .working_dir
            .clone()
            .unwrap_or_else(|| self.config.working_root.clone());
        let cancel = self.store.with_user(user, |session| {
            session.reset_for_new_task(
                task_id,
                Some(working_dir.clone()),
                request.resume_session_id.clone(),
            )
        });
        tglog!(
            "Starting task {} for user {} in {}",
            task_id.short(),
            user,
            working_dir.display()
        );

        if !working_dir.is_dir() {
            let message = format!("Working directory does not exist: {}", working_dir.display());
            tglog_error!("User {}: {}", user, message);
            sink.notify(user, Notification::Error(message.clone()));
            return self.finish(user, TaskResult::failed(task_id, message, 0), sink.as_ref());
        }

        let run = TaskRun {
            user,
            task_id,
            prompt: request.prompt,
            working_dir,
            resume_session_id: request.resume_session_id,
            cancel,
            config: self.config.clone(),
            gates: self.gates.clone(),
            factory: self.factory.clone(),
            sink: sink.clone(),
        };
        let supervisor = tokio::spawn(run.execute());
        let abort = supervisor.abort_handle();
        let registered = self
            .store
            .with_existing(user, |session| session.attach_supervisor(task_id, abort))
            .unwrap_or(false);
        if !registered {
            // Cancelled between reset and spawn.
            supervisor.abort();
        }

        let result = match supervisor.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => TaskResult::cancelled(task_id, 0),
            Err(e) => {
                let err = Error::TaskJoin(e.to_string());
                tglog_error!("Supervisor for user {} failed: {}", user, err);
                sink.notify(user, Notification::Error(err.to_string()));
                TaskResult::failed(task_id, err.to_string(), 0)
            }
        };
        self.finish(user, result, sink.as_ref())
    }

    /// Record the terminal status if the task is still current, then report.
    fn finish(&self, user: UserId, mut result: TaskResult, sink: &dyn NotificationSink) -> TaskResult {
        let applied = self
            .store
            .with_existing(user, |session| {
                session.finish(result.task_id, result.status, result.session_id.clone())
            })
            .unwrap_or(false);

        if applied {
            tglog!(
                "Task {} for user {} finished: {} (attempts={})",
                result.task_id.short(),
                user,
                result.status,
                result.attempts
            );
        } else {
            tglog_debug!(
                "Task {} for user {} was superseded before finishing",
                result.task_id.short(),
                user
            );
            result.status = TaskStatus::Cancelled;
        }
        sink.notify(user, Notification::TaskFinished(result.clone()));
        result
    }

    /// Cancel the user's current task. Returns `false` if nothing was running.
    pub async fn cancel(&self, user: UserId) -> bool {
        self.canceller.cancel(user).await
    }

    pub fn respond_to_permission(
        &self,
        user: UserId,
        approved: bool,
        clarification: Option<String>,
    ) -> bool {
        self.gates.respond::<PermissionGate>(
            user,
            PermissionResponse {
                approved,
                clarification,
            },
        )
    }

    pub fn respond_to_question(&self, user: UserId, answer: impl Into<String>) -> bool {
        self.gates.respond::<QuestionGate>(user, answer.into())
    }

    pub fn respond_to_plan(&self, user: UserId, response: PlanResponse) -> bool {
        self.gates.respond::<PlanGate>(user, response)
    }

    pub fn status(&self, user: UserId) -> TaskStatus {
        self.store
            .read_user(user, |session| session.status())
            .unwrap_or_default()
    }

    pub fn is_running(&self, user: UserId) -> bool {
        self.status(user).is_active()
    }

    pub fn pending_permission(&self, user: UserId) -> Option<PermissionRequest> {
        self.gates.pending::<PermissionGate>(user)
    }

    pub fn pending_question(&self, user: UserId) -> Option<QuestionRequest> {
        self.gates.pending::<QuestionGate>(user)
    }

    pub fn pending_plan(&self, user: UserId) -> Option<PlanApprovalRequest> {
        self.gates.pending::<PlanGate>(user)
    }

    pub fn snapshot(&self, user: UserId) -> Option<SessionSnapshot> {
        self.store.snapshot(user)
    }

    pub fn last_session_id(&self, user: UserId) -> Option<String> {
        self.store
            .read_user(user, |session| session.last_session_id().map(str::to_string))
            .flatten()
    }

    /// Override the configured permission mode for one user. `true` trusts
    /// everything but plans; `false` forces human review even under trust-all.
    pub fn set_trust(&self, user: UserId, trusted: bool) {
        self.store
            .with_user(user, |session| session.trust_override = Some(trusted));
        tglog!("Trust for user {} set to {}", user, trusted);
    }

    pub fn trust_enabled(&self, user: UserId) -> bool {
        let mode = self.config.permission_mode;
        self.store
            .read_user(user, |session| session.trust_override())
            .flatten()
            .unwrap_or(mode == crate::config::PermissionMode::TrustAll)
    }

    /// Start evicting idle sessions in the background. Calling this again
    /// replaces the running reaper.
    pub fn start_reaper(&self) {
        let handle = StaleStateReaper::new(self.store.clone(), self.config.session_ttl())
            .with_interval(self.config.reap_interval())
            .spawn();
        let mut reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = reaper.replace(handle) {
            previous.shutdown();
        }
    }

    /// Cancel every running task and stop the reaper.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.shutdown();
        }
        let mut cancelled = 0;
        for user in self.store.users() {
            if self.canceller.cancel(user).await {
                cancelled += 1;
            }
        }
        tglog!("Orchestrator shut down; cancelled {} task(s)", cancelled);
    }
}
