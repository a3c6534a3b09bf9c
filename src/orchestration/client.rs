//! Seams to the agent execution backend.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::UserId;
use crate::Result;

/// One invocation of the execution backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub resume_session_id: Option<String>,
}

/// Final accounting the backend reports when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Completion(Completion),
}

pub type EventStream = BoxStream<'static, Result<ExecutionEvent>>;

/// Verdict returned to the backend for one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    Allow { updated_input: Value },
    /// `interrupt` asks the backend to stop the whole run, not just skip
    /// this tool call.
    Deny { message: String, interrupt: bool },
}

impl ToolDecision {
    pub fn allow(input: Value) -> Self {
        ToolDecision::Allow {
            updated_input: input,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        ToolDecision::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    pub fn interrupt(message: impl Into<String>) -> Self {
        ToolDecision::Deny {
            message: message.into(),
            interrupt: true,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, ToolDecision::Allow { .. })
    }
}

/// Called by the backend before every tool invocation.
#[async_trait]
pub trait ToolCallHandler: Send + Sync {
    async fn can_use_tool(&self, tool_name: &str, input: Value) -> ToolDecision;
}

/// An agent execution backend.
///
/// `run` streams events until the run completes. The handler is consulted
/// before every tool invocation and may suspend for as long as a human
/// takes to answer.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn run(&self, request: RunRequest, handler: Arc<dyn ToolCallHandler>) -> Result<EventStream>;

    /// Ask the backend to stop the current run.
    async fn interrupt(&self) -> Result<()>;
}

/// Builds one client per task attempt.
pub trait ClientFactory: Send + Sync {
    fn create(&self, user: UserId) -> Arc<dyn ExecutionClient>;
}

impl<F> ClientFactory for F
where
    F: Fn(UserId) -> Arc<dyn ExecutionClient> + Send + Sync,
{
    fn create(&self, user: UserId) -> Arc<dyn ExecutionClient> {
        self(user)
    }
}
