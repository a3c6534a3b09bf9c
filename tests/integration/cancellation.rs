//! Cancellation of running and gated tasks.

use serde_json::json;

use taskgate::orchestration::{Notification, Script};
use taskgate::{PermissionMode, TaskStatus, UserId};

use super::fixtures::{join, script, wait_until, Harness, MockBackend};

fn long_sleep() -> Script {
    script(json!({
        "steps": [
            {"type": "text", "text": "working"},
            {"type": "sleep", "ms": 60000},
            {"type": "text", "text": "never"}
        ]
    }))
}

#[tokio::test]
async fn test_cancel_without_task_returns_false() {
    let backend = MockBackend::new(script(json!({"completion": {"num_turns": 1}})));
    let h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(1);

    assert!(!h.orchestrator.cancel(user).await);

    let result = join("task", h.spawn(user, "quick")).await;
    assert_eq!(result.status, TaskStatus::Completed);
    assert!(!h.orchestrator.cancel(user).await);
    assert_eq!(h.orchestrator.status(user), TaskStatus::Completed);
    assert_eq!(h.backend.interrupts(), 0);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_permission() {
    let backend = MockBackend::new(script(json!({
        "steps": [{"type": "tool", "name": "Bash", "input": {"command": "deploy"}}]
    })));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(2);
    let task = h.spawn(user, "deploy");

    h.expect("permission", |n| {
        matches!(n, Notification::PermissionRequested { .. })
    })
    .await;
    assert!(h.orchestrator.cancel(user).await);

    let result = join("task", task).await;
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert_eq!(h.orchestrator.status(user), TaskStatus::Idle);
    assert!(h.orchestrator.pending_permission(user).is_none());
    assert_eq!(h.backend.interrupts(), 1);

    assert!(!h.orchestrator.cancel(user).await);
    assert!(!h.orchestrator.respond_to_permission(user, true, None));
    assert_eq!(h.backend.interrupts(), 1);

    let (_, finished) = h
        .expect("finish", |n| matches!(n, Notification::TaskFinished(_)))
        .await;
    assert!(matches!(finished, Notification::TaskFinished(r) if r.status == TaskStatus::Cancelled));
}

#[tokio::test]
async fn test_cancel_while_backend_is_busy() {
    let backend = MockBackend::new(long_sleep());
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(3);
    let task = h.spawn(user, "slow");

    h.expect("first text", |n| matches!(n, Notification::Text(_)))
        .await;
    assert!(h.orchestrator.is_running(user));
    assert!(h.orchestrator.cancel(user).await);

    let result = join("task", task).await;
    assert_eq!(result.status, TaskStatus::Cancelled);
    assert!(!result.output.contains("never"));
    assert!(!h.orchestrator.is_running(user));
}

#[tokio::test]
async fn test_cancel_while_waiting_for_answer() {
    let backend = MockBackend::new(script(json!({
        "steps": [{
            "type": "tool",
            "name": "AskUserQuestion",
            "input": {"questions": [{"question": "Proceed?", "options": [{"label": "yes"}]}]}
        }]
    })));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(4);
    let task = h.spawn(user, "ask");

    h.expect("question", |n| matches!(n, Notification::QuestionAsked(_)))
        .await;
    assert_eq!(h.orchestrator.status(user), TaskStatus::WaitingAnswer);
    assert!(h.orchestrator.cancel(user).await);
    assert!(!h.orchestrator.respond_to_question(user, "yes"));

    assert_eq!(join("task", task).await.status, TaskStatus::Cancelled);
    assert!(h.orchestrator.pending_question(user).is_none());
}

#[tokio::test]
async fn test_shutdown_cancels_every_user() {
    let backend = MockBackend::new(long_sleep());
    let h = Harness::new(PermissionMode::Default, backend);
    let users = [UserId(5), UserId(6)];
    let tasks: Vec<_> = users.iter().map(|&user| h.spawn(user, "slow")).collect();

    let orchestrator = h.orchestrator.clone();
    wait_until("both running", || {
        users.iter().all(|&user| orchestrator.is_running(user))
    })
    .await;
    let backend = h.backend.clone();
    wait_until("both clients attached", || backend.requests().len() == 2).await;

    h.orchestrator.shutdown().await;
    for task in tasks {
        assert_eq!(join("task", task).await.status, TaskStatus::Cancelled);
    }
    assert_eq!(h.backend.interrupts(), 2);
    assert!(users.iter().all(|&user| !h.orchestrator.is_running(user)));
}
