//! Human-in-the-loop gates.
//!
//! Permission, question and plan approval are one protocol instantiated three
//! times. Each [`GateKind`] names its request and response types, the status a
//! session enters while waiting, the response used when nobody answers in
//! time, and whether trust mode may answer on a human's behalf.
//!
//! A gate moves `Idle -> Pending -> {Resolved | TimedOut | Cancelled} -> Idle`.
//! [`GateManager::open`] arms the gate and must run before
//! [`GateManager::wait`], so a response that arrives immediately is kept.

mod manager;
mod slot;

pub use manager::GateManager;
pub use slot::{GateSlot, GateTicket};

use serde::{Deserialize, Serialize};

use crate::session::{PermissionRequest, PlanApprovalRequest, QuestionRequest, TaskStatus};
use crate::state::UserSession;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Permission,
    Question,
    Plan,
}

impl GateType {
    /// Whether trust mode may resolve this gate without a human.
    pub fn is_overridable(&self) -> bool {
        !matches!(self, GateType::Plan)
    }
}

impl std::fmt::Display for GateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateType::Permission => write!(f, "permission"),
            GateType::Question => write!(f, "question"),
            GateType::Plan => write!(f, "plan"),
        }
    }
}

/// How a wait on a gate ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome<R> {
    Resolved(R),
    TimedOut,
    Cancelled,
}

impl<R> GateOutcome<R> {
    /// The response to act on, substituting `default` for a timeout.
    /// `None` means the waiting tool call must not proceed at all.
    pub fn or_default(self, default: impl FnOnce() -> R) -> Option<R> {
        match self {
            GateOutcome::Resolved(r) => Some(r),
            GateOutcome::TimedOut => Some(default()),
            GateOutcome::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GateOutcome::Cancelled)
    }
}

/// One gate protocol instantiation.
pub trait GateKind: Send + Sync + 'static {
    type Request: Clone + Send + 'static;
    type Response: Clone + Send + std::fmt::Debug + 'static;

    const TYPE: GateType;

    /// Status the session holds while this gate is pending.
    fn waiting_status() -> TaskStatus;

    /// Response used when the gate times out.
    fn timeout_default() -> Self::Response;

    /// Response trust mode delivers for `request`, if the gate allows it.
    fn auto_response(request: &Self::Request) -> Option<Self::Response>;

    fn slot(session: &mut UserSession) -> &mut GateSlot<Self::Request, Self::Response>;

    fn slot_ref(session: &UserSession) -> &GateSlot<Self::Request, Self::Response>;
}

/// A human's answer to a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub approved: bool,
    /// Extra guidance passed back to the agent alongside a denial.
    #[serde(default)]
    pub clarification: Option<String>,
}

impl PermissionResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            clarification: None,
        }
    }

    pub fn deny() -> Self {
        Self {
            approved: false,
            clarification: None,
        }
    }

    pub fn clarify(text: &str) -> Self {
        Self {
            approved: false,
            clarification: Some(text.to_string()),
        }
    }
}

/// A human's verdict on a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanResponse {
    Approve,
    Reject,
    /// Stop the whole task.
    Cancel,
    /// Send the plan back with feedback.
    Clarify(String),
}

impl std::str::FromStr for PlanResponse {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(text) = s.strip_prefix("clarify:") {
            return Ok(PlanResponse::Clarify(text.trim().to_string()));
        }
        match s {
            "approve" => Ok(PlanResponse::Approve),
            "reject" => Ok(PlanResponse::Reject),
            "cancel" => Ok(PlanResponse::Cancel),
            other => Err(Error::Validation(format!("unknown plan response: {}", other))),
        }
    }
}

impl std::fmt::Display for PlanResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanResponse::Approve => write!(f, "approve"),
            PlanResponse::Reject => write!(f, "reject"),
            PlanResponse::Cancel => write!(f, "cancel"),
            PlanResponse::Clarify(text) => write!(f, "clarify:{}", text),
        }
    }
}

pub struct PermissionGate;

impl GateKind for PermissionGate {
    type Request = PermissionRequest;
    type Response = PermissionResponse;

    const TYPE: GateType = GateType::Permission;

    fn waiting_status() -> TaskStatus {
        TaskStatus::WaitingPermission
    }

    fn timeout_default() -> PermissionResponse {
        PermissionResponse::deny()
    }

    fn auto_response(_request: &PermissionRequest) -> Option<PermissionResponse> {
        Some(PermissionResponse::approve())
    }

    fn slot(session: &mut UserSession) -> &mut GateSlot<PermissionRequest, PermissionResponse> {
        &mut session.permission
    }

    fn slot_ref(session: &UserSession) -> &GateSlot<PermissionRequest, PermissionResponse> {
        &session.permission
    }
}

pub struct QuestionGate;

impl GateKind for QuestionGate {
    type Request = QuestionRequest;
    type Response = String;

    const TYPE: GateType = GateType::Question;

    fn waiting_status() -> TaskStatus {
        TaskStatus::WaitingAnswer
    }

    fn timeout_default() -> String {
        String::new()
    }

    /// Trust mode picks the first offered option.
    fn auto_response(request: &QuestionRequest) -> Option<String> {
        Some(request.options.first().cloned().unwrap_or_default())
    }

    fn slot(session: &mut UserSession) -> &mut GateSlot<QuestionRequest, String> {
        &mut session.question
    }

    fn slot_ref(session: &UserSession) -> &GateSlot<QuestionRequest, String> {
        &session.question
    }
}

pub struct PlanGate;

impl GateKind for PlanGate {
    type Request = PlanApprovalRequest;
    type Response = PlanResponse;

    const TYPE: GateType = GateType::Plan;

    fn waiting_status() -> TaskStatus {
        TaskStatus::WaitingPermission
    }

    fn timeout_default() -> PlanResponse {
        PlanResponse::Reject
    }

    /// Plans always wait for a human.
    fn auto_response(_request: &PlanApprovalRequest) -> Option<PlanResponse> {
        None
    }

    fn slot(session: &mut UserSession) -> &mut GateSlot<PlanApprovalRequest, PlanResponse> {
        &mut session.plan
    }

    fn slot_ref(session: &UserSession) -> &GateSlot<PlanApprovalRequest, PlanResponse> {
        &session.plan
    }
}
