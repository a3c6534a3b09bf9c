use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PermissionMode};
use crate::gate::{
    GateKind, GateManager, GateOutcome, PermissionGate, PlanGate, PlanResponse, QuestionGate,
};
use crate::policy::{self, Classification};
use crate::session::{PermissionRequest, PlanApprovalRequest, QuestionRequest, TaskId, UserId};
use crate::{tglog, tglog_debug, tglog_warn, Error};

use super::client::{ToolCallHandler, ToolDecision};
use super::notify::{Notification, NotificationSink};

pub const CANCELLED_MESSAGE: &str = "Task cancelled by user";

/// Tool-call handler bound to one task run.
///
/// Every decision first checks that its task is still current; a superseded
/// task gets an interrupting denial and never touches the newer task's gates.
pub(crate) struct TaskToolGate {
    user: UserId,
    task_id: TaskId,
    working_dir: PathBuf,
    cancel: CancellationToken,
    gates: GateManager,
    config: Arc<Config>,
    sink: Arc<dyn NotificationSink>,
}

impl TaskToolGate {
    pub(crate) fn new(
        user: UserId,
        task_id: TaskId,
        working_dir: PathBuf,
        cancel: CancellationToken,
        gates: GateManager,
        config: Arc<Config>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            user,
            task_id,
            working_dir,
            cancel,
            gates,
            config,
            sink,
        }
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || !self.gates.is_current(self.user, self.task_id)
    }

    /// The configured mode with the user's trust override applied.
    fn effective_mode(&self) -> PermissionMode {
        let trust = self
            .gates
            .store()
            .read_user(self.user, |session| session.trust_override())
            .flatten();
        match (trust, self.config.permission_mode) {
            (Some(true), _) => PermissionMode::TrustAll,
            (Some(false), PermissionMode::TrustAll) => PermissionMode::Default,
            (_, mode) => mode,
        }
    }

    fn open_failed(&self, err: Error) -> ToolDecision {
        match err {
            Error::GateBusy(_) => ToolDecision::deny(err.to_string()),
            other => {
                tglog_debug!(
                    "Gate open refused for user {} task {}: {}",
                    self.user,
                    self.task_id.short(),
                    other
                );
                ToolDecision::interrupt(CANCELLED_MESSAGE)
            }
        }
    }

    /// The response to act on, or `None` when the task was cancelled.
    fn settle<K: GateKind>(&self, outcome: GateOutcome<K::Response>) -> Option<K::Response> {
        if matches!(outcome, GateOutcome::TimedOut) {
            tglog_warn!(
                "User {}: {}",
                self.user,
                Notification::timed_out_message(K::TYPE)
            );
            self.sink.notify(self.user, Notification::GateTimedOut(K::TYPE));
        }
        outcome.or_default(K::timeout_default)
    }

    async fn request_permission(
        &self,
        tool_name: &str,
        input: Value,
        warning: Option<String>,
        trusted: bool,
    ) -> ToolDecision {
        let request = PermissionRequest::new(self.user, tool_name, input.clone());
        let ticket = match self
            .gates
            .open::<PermissionGate>(self.user, self.task_id, request.clone())
        {
            Ok(ticket) => ticket,
            Err(e) => return self.open_failed(e),
        };

        if let Some(warning) = &warning {
            tglog_warn!("User {}: {}", self.user, warning);
        }
        self.sink.notify(
            self.user,
            Notification::PermissionRequested {
                request,
                details: policy::describe_input(tool_name, &input),
                warning,
            },
        );
        if trusted {
            self.gates.auto_resolve::<PermissionGate>(self.user);
        }

        let outcome = self
            .gates
            .wait::<PermissionGate>(self.user, ticket, self.config.gate_timeout(PermissionGate::TYPE))
            .await;
        let Some(response) = self.settle::<PermissionGate>(outcome) else {
            return ToolDecision::interrupt(CANCELLED_MESSAGE);
        };

        self.sink.notify(
            self.user,
            Notification::PermissionCompleted {
                approved: response.approved,
            },
        );
        if response.approved {
            return ToolDecision::allow(input);
        }
        match response.clarification {
            Some(text) => ToolDecision::deny(format!("User provided additional context: {}", text)),
            None => ToolDecision::deny("User rejected the operation"),
        }
    }

    async fn ask_question(
        &self,
        input: Value,
        question: String,
        options: Vec<String>,
        trusted: bool,
    ) -> ToolDecision {
        let request = QuestionRequest::new(self.user, &question, options);
        let ticket = match self
            .gates
            .open::<QuestionGate>(self.user, self.task_id, request.clone())
        {
            Ok(ticket) => ticket,
            Err(e) => return self.open_failed(e),
        };

        self.sink.notify(self.user, Notification::QuestionAsked(request));
        if trusted {
            self.gates.auto_resolve::<QuestionGate>(self.user);
        }

        let outcome = self
            .gates
            .wait::<QuestionGate>(self.user, ticket, self.config.gate_timeout(QuestionGate::TYPE))
            .await;
        let Some(answer) = self.settle::<QuestionGate>(outcome) else {
            return ToolDecision::interrupt(CANCELLED_MESSAGE);
        };

        self.sink.notify(
            self.user,
            Notification::QuestionAnswered {
                answer: answer.clone(),
            },
        );
        ToolDecision::allow(with_answer(input, question, answer))
    }

    async fn review_plan(
        &self,
        input: Value,
        plan_file: Option<String>,
        plan_content: Option<String>,
    ) -> ToolDecision {
        let request = PlanApprovalRequest::new(self.user, plan_file, plan_content);
        let ticket = match self
            .gates
            .open::<PlanGate>(self.user, self.task_id, request.clone())
        {
            Ok(ticket) => ticket,
            Err(e) => return self.open_failed(e),
        };

        tglog!("Plan review requested for user {}", self.user);
        self.sink.notify(self.user, Notification::PlanRequested(request));

        let outcome = self
            .gates
            .wait::<PlanGate>(self.user, ticket, self.config.gate_timeout(PlanGate::TYPE))
            .await;
        let Some(response) = self.settle::<PlanGate>(outcome) else {
            return ToolDecision::interrupt(CANCELLED_MESSAGE);
        };

        tglog!("Plan for user {} resolved: {}", self.user, response);
        match response {
            PlanResponse::Approve => ToolDecision::allow(input),
            PlanResponse::Reject => ToolDecision::deny("User rejected the plan"),
            PlanResponse::Clarify(text) => {
                ToolDecision::deny(format!("User requested clarification: {}", text))
            }
            PlanResponse::Cancel => ToolDecision::interrupt("User cancelled the task"),
        }
    }
}

/// Add `answers: {question: answer}` to the tool input.
fn with_answer(input: Value, question: String, answer: String) -> Value {
    let mut answers = Map::new();
    answers.insert(question, Value::String(answer));
    match input {
        Value::Object(mut map) => {
            map.insert("answers".to_string(), Value::Object(answers));
            Value::Object(map)
        }
        other => other,
    }
}

#[async_trait]
impl ToolCallHandler for TaskToolGate {
    async fn can_use_tool(&self, tool_name: &str, input: Value) -> ToolDecision {
        tglog_debug!(
            "can_use_tool user={} task={} tool={}",
            self.user,
            self.task_id.short(),
            tool_name
        );
        if self.is_stopped() {
            return ToolDecision::interrupt(CANCELLED_MESSAGE);
        }

        let mode = self.effective_mode();
        let trusted = mode == PermissionMode::TrustAll;
        match policy::classify(tool_name, &input, &self.working_dir, mode) {
            Classification::AutoAllow => ToolDecision::allow(input),
            Classification::Deny { reason } => {
                tglog_warn!("Isolation block for user {}: {} {}", self.user, tool_name, reason);
                ToolDecision::deny(reason)
            }
            Classification::RequiresApproval { warning } => {
                self.request_permission(tool_name, input, warning, trusted)
                    .await
            }
            Classification::RequiresAnswer { question, options } => {
                self.ask_question(input, question, options, trusted).await
            }
            Classification::RequiresPlanReview {
                plan_file,
                plan_content,
            } => self.review_plan(input, plan_file, plan_content).await,
        }
    }
}
