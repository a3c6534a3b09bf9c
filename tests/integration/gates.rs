//! Gate round trips through a running task.

use serde_json::{json, Value};

use taskgate::gate::GateType;
use taskgate::orchestration::Notification;
use taskgate::{PermissionMode, PlanResponse, TaskStatus, UserId};

use super::fixtures::{is_tool_result, join, script, tool_result, Harness, MockBackend};

fn one_tool(name: &str, input: Value) -> taskgate::orchestration::Script {
    script(json!({
        "steps": [{"type": "tool", "name": name, "input": input}],
        "completion": {"session_id": "s-1", "num_turns": 3, "result": "done"}
    }))
}

fn is_permission_request(n: &Notification) -> bool {
    matches!(n, Notification::PermissionRequested { .. })
}

#[tokio::test]
async fn test_permission_approved_allows_tool() {
    let backend = MockBackend::new(one_tool("Bash", json!({"command": "cargo check"})));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(1);
    let task = h.spawn(user, "build it");

    let (who, requested) = h.expect("permission request", is_permission_request).await;
    assert_eq!(who, user);
    let Notification::PermissionRequested {
        request,
        details,
        warning,
    } = requested
    else {
        unreachable!();
    };
    assert_eq!(request.tool_name, "Bash");
    assert_eq!(details, "cargo check");
    assert!(warning.is_none());
    assert_eq!(h.orchestrator.status(user), TaskStatus::WaitingPermission);
    assert_eq!(
        h.orchestrator.pending_permission(user).map(|p| p.request_id),
        Some(request.request_id)
    );

    assert!(h.orchestrator.respond_to_permission(user, true, None));
    let (_, completed) = h
        .expect("permission completed", |n| {
            matches!(n, Notification::PermissionCompleted { .. })
        })
        .await;
    assert_eq!(completed, Notification::PermissionCompleted { approved: true });
    let (_, result) = h.expect("tool result", is_tool_result).await;
    assert!(!tool_result(&result).1);

    let result = join("task", task).await;
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.session_id.as_deref(), Some("s-1"));
    assert!(h.orchestrator.pending_permission(user).is_none());
}

#[tokio::test]
async fn test_permission_denial_carries_clarification() {
    let backend = MockBackend::new(one_tool("Bash", json!({"command": "rm -rf target"})));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(2);
    let task = h.spawn(user, "clean up");

    h.expect("permission request", is_permission_request).await;
    assert!(h.orchestrator.respond_to_permission(
        user,
        false,
        Some("use cargo clean instead".to_string())
    ));

    let (_, result) = h.expect("tool result", is_tool_result).await;
    assert_eq!(
        tool_result(&result),
        (
            "User provided additional context: use cargo clean instead".to_string(),
            true
        )
    );
    assert_eq!(join("task", task).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_second_response_is_rejected_and_first_stands() {
    let backend = MockBackend::new(one_tool("Write", json!({"file_path": "out.txt", "content": "x"})));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(3);
    let task = h.spawn(user, "write a file");

    h.expect("permission request", is_permission_request).await;
    assert!(h.orchestrator.respond_to_permission(user, true, None));
    assert!(!h.orchestrator.respond_to_permission(user, false, None));

    let (_, result) = h.expect("tool result", is_tool_result).await;
    assert!(!tool_result(&result).1);
    assert_eq!(join("task", task).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_question_answer_is_injected() {
    let input = json!({
        "questions": [{
            "question": "Which database?",
            "options": [{"label": "PostgreSQL"}, {"label": "SQLite"}]
        }]
    });
    let backend = MockBackend::new(one_tool("AskUserQuestion", input));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(4);
    let task = h.spawn(user, "set up storage");

    let (_, asked) = h
        .expect("question", |n| matches!(n, Notification::QuestionAsked(_)))
        .await;
    let Notification::QuestionAsked(question) = asked else {
        unreachable!();
    };
    assert_eq!(question.options, vec!["PostgreSQL", "SQLite"]);
    assert_eq!(h.orchestrator.status(user), TaskStatus::WaitingAnswer);
    assert!(h.orchestrator.respond_to_question(user, "SQLite"));

    let (_, result) = h.expect("tool result", is_tool_result).await;
    let (content, is_error) = tool_result(&result);
    assert!(!is_error);
    let updated: Value = serde_json::from_str(&content).unwrap();
    assert_eq!(updated["answers"]["Which database?"], "SQLite");
    assert_eq!(join("task", task).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_plan_clarification_denies_and_continues() {
    let backend = MockBackend::new(one_tool("ExitPlanMode", json!({"plan": "1. rewrite everything"})));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(5);
    let task = h.spawn(user, "plan it");

    let (_, requested) = h
        .expect("plan request", |n| matches!(n, Notification::PlanRequested(_)))
        .await;
    let Notification::PlanRequested(plan) = requested else {
        unreachable!();
    };
    assert_eq!(plan.plan_content.as_deref(), Some("1. rewrite everything"));
    assert!(h
        .orchestrator
        .respond_to_plan(user, "clarify:smaller steps".parse().unwrap()));

    let (_, result) = h.expect("tool result", is_tool_result).await;
    assert_eq!(
        tool_result(&result),
        ("User requested clarification: smaller steps".to_string(), true)
    );
    assert_eq!(join("task", task).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_plan_cancel_interrupts_run() {
    let backend = MockBackend::new(script(json!({
        "steps": [
            {"type": "tool", "name": "ExitPlanMode", "input": {"plan": "1. go"}},
            {"type": "text", "text": "should not run"}
        ]
    })));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(6);
    let task = h.spawn(user, "plan it");

    h.expect("plan request", |n| matches!(n, Notification::PlanRequested(_)))
        .await;
    assert!(h.orchestrator.respond_to_plan(user, PlanResponse::Cancel));

    let result = join("task", task).await;
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("User cancelled the task"));
    assert!(!result.output.contains("should not run"));
}

#[tokio::test]
async fn test_trust_all_skips_permission_but_not_plan() {
    let backend = MockBackend::new(script(json!({
        "steps": [
            {"type": "tool", "name": "Bash", "input": {"command": "make"}},
            {"type": "tool", "name": "ExitPlanMode", "input": {"plan": "1. ship"}}
        ]
    })));
    let mut h = Harness::new(PermissionMode::TrustAll, backend);
    let user = UserId(7);
    let task = h.spawn(user, "ship it");

    let (_, completed) = h
        .expect("auto-approved permission", |n| {
            matches!(n, Notification::PermissionCompleted { .. })
        })
        .await;
    assert_eq!(completed, Notification::PermissionCompleted { approved: true });

    h.expect("plan request", |n| matches!(n, Notification::PlanRequested(_)))
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.orchestrator.pending_plan(user).is_some());
    assert_eq!(h.orchestrator.status(user), TaskStatus::WaitingPermission);
    assert!(!task.is_finished());

    assert!(h.orchestrator.respond_to_plan(user, PlanResponse::Approve));
    assert_eq!(join("task", task).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_user_trust_override_auto_approves() {
    let backend = MockBackend::new(one_tool("Bash", json!({"command": "ls"})));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(8);
    h.orchestrator.set_trust(user, true);
    assert!(h.orchestrator.trust_enabled(user));

    let task = h.spawn(user, "list");
    let (_, result) = h.expect("tool result", is_tool_result).await;
    assert!(!tool_result(&result).1);
    assert_eq!(join("task", task).await.status, TaskStatus::Completed);
    assert!(!h.orchestrator.trust_enabled(UserId(9)));
}

#[tokio::test(start_paused = true)]
async fn test_permission_timeout_denies() {
    let backend = MockBackend::new(one_tool("Bash", json!({"command": "cargo test"})));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(10);
    let task = h.spawn(user, "test it");

    let (_, timed_out) = h
        .expect("timeout", |n| matches!(n, Notification::GateTimedOut(_)))
        .await;
    assert_eq!(timed_out, Notification::GateTimedOut(GateType::Permission));
    let (_, result) = h.expect("tool result", is_tool_result).await;
    assert_eq!(
        tool_result(&result),
        ("User rejected the operation".to_string(), true)
    );
    assert_eq!(join("task", task).await.status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_question_timeout_answers_empty() {
    let input = json!({"questions": [{"question": "Name?", "options": []}]});
    let backend = MockBackend::new(one_tool("AskUserQuestion", input));
    let mut h = Harness::new(PermissionMode::Default, backend);
    let user = UserId(11);
    let task = h.spawn(user, "ask");

    let (_, timed_out) = h
        .expect("timeout", |n| matches!(n, Notification::GateTimedOut(_)))
        .await;
    assert_eq!(timed_out, Notification::GateTimedOut(GateType::Question));
    let (_, result) = h.expect("tool result", is_tool_result).await;
    let updated: Value = serde_json::from_str(&tool_result(&result).0).unwrap();
    assert_eq!(updated["answers"]["Name?"], "");
    assert_eq!(join("task", task).await.status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_plan_timeout_rejects_even_under_trust_all() {
    let backend = MockBackend::new(one_tool("ExitPlanMode", json!({"plan": "1. wait"})));
    let mut h = Harness::new(PermissionMode::TrustAll, backend);
    let user = UserId(12);
    let started = tokio::time::Instant::now();
    let task = h.spawn(user, "plan");

    let (_, timed_out) = h
        .expect("timeout", |n| matches!(n, Notification::GateTimedOut(_)))
        .await;
    assert_eq!(timed_out, Notification::GateTimedOut(GateType::Plan));
    assert!(started.elapsed() >= std::time::Duration::from_secs(600));

    let (_, result) = h.expect("tool result", is_tool_result).await;
    assert_eq!(tool_result(&result), ("User rejected the plan".to_string(), true));
    assert_eq!(join("task", task).await.status, TaskStatus::Completed);
}
