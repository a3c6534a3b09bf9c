//! Fire-and-forget notifications to the presentation layer.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::gate::GateType;
use crate::session::{PermissionRequest, PlanApprovalRequest, QuestionRequest, UserId};
use crate::tglog_trace;

use super::TaskResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notification {
    Text(String),
    Thinking(String),
    ToolUse {
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    PermissionRequested {
        request: PermissionRequest,
        details: String,
        /// Set when a shell command reaches outside the working tree.
        warning: Option<String>,
    },
    PermissionCompleted {
        approved: bool,
    },
    QuestionAsked(QuestionRequest),
    QuestionAnswered {
        answer: String,
    },
    PlanRequested(PlanApprovalRequest),
    GateTimedOut(GateType),
    Error(String),
    TaskFinished(TaskResult),
}

impl Notification {
    /// Text to show the user when a gate of kind `gate` times out.
    pub fn timed_out_message(gate: GateType) -> &'static str {
        match gate {
            GateType::Permission => "Permission request timed out",
            GateType::Question => "Question timed out",
            GateType::Plan => "Plan approval timed out",
        }
    }
}

/// Receives notifications for every user. Implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, user: UserId, notification: Notification);
}

/// Forwards notifications over an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(UserId, Notification)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(UserId, Notification)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, user: UserId, notification: Notification) {
        if self.tx.send((user, notification)).is_err() {
            tglog_trace!("Notification receiver for user {} dropped", user);
        }
    }
}

/// Discards everything.
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _user: UserId, _notification: Notification) {}
}
