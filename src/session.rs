//! Per-user task session data model.
//!
//! These are the values the state store hands out: identities, the task
//! status machine, the three kinds of pending human requests, and the
//! read-only snapshot of a user's session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use uuid::Uuid;

/// Identity of an end user on whose behalf tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Opaque identity of one task run, regenerated on every start.
///
/// Every resume point compares the id it captured against the session's
/// current id; a mismatch means the run was superseded or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    WaitingPermission,
    WaitingAnswer,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// A task is executing or paused at a gate.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::WaitingPermission | TaskStatus::WaitingAnswer
        )
    }

    /// Nothing is executing: idle or a terminal status.
    pub fn is_idle(&self) -> bool {
        !self.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Idle => write!(f, "idle"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::WaitingPermission => write!(f, "waiting_permission"),
            TaskStatus::WaitingAnswer => write!(f, "waiting_answer"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

fn request_id(prefix: &str, user: UserId) -> String {
    format!("{}_{}_{}", prefix, user, &Uuid::new_v4().simple().to_string()[..12])
}

/// A tool invocation waiting for a human allow/deny.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub created_at: DateTime<Utc>,
}

impl PermissionRequest {
    pub fn new(user: UserId, tool_name: &str, tool_input: Value) -> Self {
        Self {
            request_id: request_id("p", user),
            tool_name: tool_name.to_string(),
            tool_input,
            created_at: Utc::now(),
        }
    }
}

/// A question the agent asked, with its ordered option labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub request_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl QuestionRequest {
    pub fn new(user: UserId, question: &str, options: Vec<String>) -> Self {
        Self {
            request_id: request_id("q", user),
            question: question.to_string(),
            options,
            created_at: Utc::now(),
        }
    }
}

/// A plan waiting for human review before execution continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanApprovalRequest {
    pub request_id: String,
    pub plan_file: Option<String>,
    pub plan_content: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PlanApprovalRequest {
    pub fn new(user: UserId, plan_file: Option<String>, plan_content: Option<String>) -> Self {
        Self {
            request_id: request_id("plan", user),
            plan_file,
            plan_content,
            created_at: Utc::now(),
        }
    }
}

/// Consistent copy of a user's session taken under its lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub user_id: UserId,
    pub task_id: Option<TaskId>,
    pub status: TaskStatus,
    pub working_dir: Option<PathBuf>,
    pub resumed_session_id: Option<String>,
    pub last_session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub trust_override: Option<bool>,
    pub has_pending_permission: bool,
    pub has_pending_question: bool,
    pub has_pending_plan: bool,
}
