//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary working directories
//! - A mock execution backend that replays scripts and records runs
//! - Waiting on notifications

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use taskgate::orchestration::{
    ChannelSink, ClientFactory, EventStream, ExecutionClient, Notification, RunRequest, Script,
    ScriptedClient, TaskOrchestrator, TaskRequest, TaskResult, ToolCallHandler,
};
use taskgate::{Config, PermissionMode, Result, UserId};

/// How long a test waits on an expected notification before failing.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(900);

/// A temporary directory to run tasks in.
pub struct TestWorkspace {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        std::fs::write(path.join("README.md"), "# Test Workspace\n")
            .expect("Failed to write README");
        Self { temp_dir, path }
    }

    pub fn config(&self, mode: PermissionMode) -> Config {
        Config {
            permission_mode: mode,
            working_root: self.path.clone(),
            ..Default::default()
        }
    }
}

/// Parse a script from JSON.
pub fn script(json: Value) -> Script {
    serde_json::from_value(json).expect("Invalid test script")
}

/// Replays one script per run and records every run request.
pub struct MockBackend {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    requests: Mutex<Vec<RunRequest>>,
    interrupts: AtomicUsize,
}

impl MockBackend {
    /// Every run replays `fallback`.
    pub fn new(fallback: Script) -> Arc<Self> {
        Self::with_scripts(Vec::new(), fallback)
    }

    /// Runs replay `scripts` in order, then `fallback`.
    pub fn with_scripts(scripts: Vec<Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn ClientFactory> {
        let backend = self.clone();
        Arc::new(move |_user: UserId| -> Arc<dyn ExecutionClient> {
            Arc::new(MockClient {
                inner: ScriptedClient::new(backend.next_script()),
                backend: backend.clone(),
            })
        })
    }
}

struct MockClient {
    inner: ScriptedClient,
    backend: Arc<MockBackend>,
}

#[async_trait]
impl ExecutionClient for MockClient {
    async fn run(&self, request: RunRequest, handler: Arc<dyn ToolCallHandler>) -> Result<EventStream> {
        self.backend.requests.lock().unwrap().push(request.clone());
        self.inner.run(request, handler).await
    }

    async fn interrupt(&self) -> Result<()> {
        self.backend.interrupts.fetch_add(1, Ordering::SeqCst);
        self.inner.interrupt().await
    }
}

/// An orchestrator over `backend` plus the receiving end of its notifications.
pub struct Harness {
    pub orchestrator: Arc<TaskOrchestrator>,
    pub backend: Arc<MockBackend>,
    pub sink: Arc<ChannelSink>,
    pub events: UnboundedReceiver<(UserId, Notification)>,
    pub workspace: TestWorkspace,
}

impl Harness {
    pub fn new(mode: PermissionMode, backend: Arc<MockBackend>) -> Self {
        let workspace = TestWorkspace::new();
        Self::with_config(workspace.config(mode), backend, workspace)
    }

    pub fn with_config(config: Config, backend: Arc<MockBackend>, workspace: TestWorkspace) -> Self {
        let orchestrator = Arc::new(TaskOrchestrator::new(config, backend.factory()));
        let (sink, events) = ChannelSink::new();
        Self {
            orchestrator,
            backend,
            sink: Arc::new(sink),
            events,
            workspace,
        }
    }

    /// Start a task in the workspace on a background tokio task.
    pub fn spawn(&self, user: UserId, prompt: &str) -> JoinHandle<TaskResult> {
        self.spawn_request(user, TaskRequest::new(prompt).with_working_dir(&self.workspace.path))
    }

    pub fn spawn_request(&self, user: UserId, request: TaskRequest) -> JoinHandle<TaskResult> {
        let orchestrator = self.orchestrator.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move { orchestrator.start(user, request, sink).await })
    }

    /// Receive until a notification satisfies `pred` and return it.
    pub async fn expect<F>(&mut self, what: &str, mut pred: F) -> (UserId, Notification)
    where
        F: FnMut(&Notification) -> bool,
    {
        let found = tokio::time::timeout(EVENT_TIMEOUT, async {
            while let Some((user, notification)) = self.events.recv().await {
                if pred(&notification) {
                    return Some((user, notification));
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(found)) => found,
            Ok(None) => panic!("Notification channel closed waiting for {}", what),
            Err(_) => panic!("Timed out waiting for {}", what),
        }
    }

    /// Drain whatever notifications are already queued.
    pub fn drain(&mut self) -> Vec<(UserId, Notification)> {
        let mut drained = Vec::new();
        while let Ok(item) = self.events.try_recv() {
            drained.push(item);
        }
        drained
    }
}

/// Poll `check` until it holds, yielding to other tasks in between.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition never held: {}", what);
}

/// Await a spawned task's result, failing the test if it hangs.
pub async fn join<T>(what: &str, handle: impl Future<Output = std::result::Result<T, tokio::task::JoinError>>) -> T {
    match tokio::time::timeout(EVENT_TIMEOUT, handle).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => panic!("{} panicked: {}", what, e),
        Err(_) => panic!("Timed out joining {}", what),
    }
}

pub fn is_tool_result(notification: &Notification) -> bool {
    matches!(notification, Notification::ToolResult { .. })
}

/// Content and error flag of a tool result notification.
pub fn tool_result(notification: &Notification) -> (String, bool) {
    match notification {
        Notification::ToolResult {
            content, is_error, ..
        } => (content.clone(), *is_error),
        other => panic!("Expected a tool result, got {:?}", other),
    }
}
