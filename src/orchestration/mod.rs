//! Task orchestration: the execution client seam, per-task tool gating,
//! cancellation and the orchestrator that ties them together.

pub mod cancel;
pub mod client;
pub mod notify;
mod orchestrator;
pub mod scripted;
mod tool_gate;

pub use cancel::CancellationController;
pub use client::{
    ClientFactory, Completion, EventStream, ExecutionClient, ExecutionEvent, RunRequest,
    ToolCallHandler, ToolDecision,
};
pub use notify::{ChannelSink, Notification, NotificationSink, NullSink};
pub use orchestrator::{TaskOrchestrator, TaskRequest, TaskResult};
pub use scripted::{Script, ScriptResponses, ScriptStep, ScriptedClient};
pub use tool_gate::CANCELLED_MESSAGE;
