pub mod config;
pub mod error;
pub mod log;
pub mod policy;
pub mod session;

// Gating and orchestration core
pub mod actors;
pub mod gate;
pub mod orchestration;
pub mod state;

pub use config::{Config, PermissionMode};
pub use error::{Error, Result};
pub use gate::{GateOutcome, GateType, PermissionResponse, PlanResponse};
pub use orchestration::{
    ChannelSink, ClientFactory, ExecutionClient, Notification, NotificationSink, TaskOrchestrator,
    TaskRequest, TaskResult, ToolDecision,
};
pub use policy::{classify, Classification};
pub use session::{SessionSnapshot, TaskId, TaskStatus, UserId};
