//! Execution client that replays a JSON script.
//!
//! Used by the `taskgate run` command to exercise the orchestrator without a
//! real agent backend. Tool steps go through the same tool-call handler a
//! real backend would consult.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{tglog_debug, Error, Result};

use super::client::{
    Completion, EventStream, ExecutionClient, ExecutionEvent, RunRequest, ToolCallHandler,
    ToolDecision,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStep {
    Text { text: String },
    Thinking { text: String },
    Tool {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Sleep { ms: u64 },
    /// End the stream with a client error.
    Fail { message: String },
}

/// Canned answers for `--auto-respond`, consumed in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptResponses {
    #[serde(default)]
    pub permission: Vec<bool>,
    #[serde(default)]
    pub question: Vec<String>,
    #[serde(default)]
    pub plan: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
    #[serde(default)]
    pub completion: Completion,
    #[serde(default)]
    pub responses: ScriptResponses,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let script: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        tglog_debug!(
            "Loaded script {} with {} steps",
            path.display(),
            script.steps.len()
        );
        Ok(script)
    }
}

struct Playback {
    steps: VecDeque<ScriptStep>,
    queued: VecDeque<ExecutionEvent>,
    completion: Option<Completion>,
    handler: Arc<dyn ToolCallHandler>,
    interrupted: CancellationToken,
    next_tool_id: u32,
}

impl Playback {
    async fn play(&mut self, step: ScriptStep) -> Result<()> {
        match step {
            ScriptStep::Text { text } => self.queued.push_back(ExecutionEvent::Text(text)),
            ScriptStep::Thinking { text } => self.queued.push_back(ExecutionEvent::Thinking(text)),
            ScriptStep::Sleep { ms } => {
                tokio::select! {
                    _ = self.interrupted.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }
            ScriptStep::Fail { message } => return Err(Error::Client(message)),
            ScriptStep::Tool { name, input } => {
                self.next_tool_id += 1;
                let id = format!("tool_{}", self.next_tool_id);
                self.queued.push_back(ExecutionEvent::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                let decision = self.handler.can_use_tool(&name, input).await;
                let (content, is_error) = match decision {
                    ToolDecision::Allow { updated_input } => (updated_input.to_string(), false),
                    ToolDecision::Deny { message, interrupt } => {
                        if interrupt {
                            self.steps.clear();
                            self.completion = Some(Completion {
                                is_error: true,
                                result: Some(message.clone()),
                                ..self.completion.take().unwrap_or_default()
                            });
                        }
                        (message, true)
                    }
                };
                self.queued.push_back(ExecutionEvent::ToolResult {
                    tool_use_id: id,
                    content,
                    is_error,
                });
            }
        }
        Ok(())
    }
}

pub struct ScriptedClient {
    script: Script,
    interrupted: CancellationToken,
}

impl ScriptedClient {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            interrupted: CancellationToken::new(),
        }
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.is_cancelled()
    }
}

#[async_trait]
impl ExecutionClient for ScriptedClient {
    async fn run(&self, request: RunRequest, handler: Arc<dyn ToolCallHandler>) -> Result<EventStream> {
        tglog_debug!(
            "ScriptedClient::run cwd={} resume={:?}",
            request.working_dir.display(),
            request.resume_session_id
        );
        let playback = Playback {
            steps: self.script.steps.iter().cloned().collect(),
            queued: VecDeque::new(),
            completion: Some(self.script.completion.clone()),
            handler,
            interrupted: self.interrupted.clone(),
            next_tool_id: 0,
        };

        let events = stream::unfold(playback, |mut playback| async move {
            loop {
                if let Some(event) = playback.queued.pop_front() {
                    return Some((Ok(event), playback));
                }
                if playback.interrupted.is_cancelled() {
                    return None;
                }
                match playback.steps.pop_front() {
                    Some(step) => {
                        if let Err(e) = playback.play(step).await {
                            playback.steps.clear();
                            playback.completion = None;
                            return Some((Err(e), playback));
                        }
                    }
                    None => {
                        let completion = playback.completion.take()?;
                        return Some((Ok(ExecutionEvent::Completion(completion)), playback));
                    }
                }
            }
        });
        Ok(events.boxed())
    }

    async fn interrupt(&self) -> Result<()> {
        self.interrupted.cancel();
        Ok(())
    }
}
